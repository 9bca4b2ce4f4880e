//! 结果聚合服务
//!
//! 结果、统计和模型变更三个队列各有一个监听器，全部写入同一个 [`MetricsStore`]。
//! 看门狗负责检测空闲结束，探针定期窥视模型槽位。所有后台任务断线后按固定间隔重连。

use futures::StreamExt;
use montecarlo_config::{AggregatorConfig, AppConfig};
use montecarlo_domain::{
    model::short_version, AggregateSnapshot, BusEvent, DashboardEvent, ScenarioResult,
    SimulationFinishedEvent, WorkerStats,
};
use montecarlo_errors::SimulationResult;
use montecarlo_infrastructure::{
    dashboard_queue_spec, results_queue_spec, stats_queue_spec, BrokerConnector, BrokerLink,
    ModelChannel, QueueSpec, RetryPolicy, SlotStatus,
};
use montecarlo_observability::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::hub::DashboardHub;
use crate::store::{MetricsStore, ResultOutcome, SlotObservation};

/// 聚合端消费的输入队列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStream {
    Results,
    Stats,
    ModelChanges,
}

impl InboundStream {
    pub const ALL: [InboundStream; 3] = [
        InboundStream::Results,
        InboundStream::Stats,
        InboundStream::ModelChanges,
    ];

    pub fn consumer_tag(&self) -> &'static str {
        match self {
            InboundStream::Results => "aggregator-results",
            InboundStream::Stats => "aggregator-stats",
            InboundStream::ModelChanges => "aggregator-dashboard",
        }
    }
}

enum ListenOutcome {
    Shutdown,
    StreamEnded,
}

pub struct Aggregator {
    connector: Arc<dyn BrokerConnector>,
    config: AggregatorConfig,
    store: Mutex<MetricsStore>,
    hub: DashboardHub,
    models: ModelChannel,
    results_spec: QueueSpec,
    stats_spec: QueueSpec,
    dashboard_spec: QueueSpec,
    metrics: Arc<MetricsCollector>,
}

impl Aggregator {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        config: &AppConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let models = ModelChannel::new(connector.clone(), &config.queues.model, config.model.clone());
        Self {
            store: Mutex::new(MetricsStore::new(&config.aggregator, models.ttl())),
            hub: DashboardHub::new(config.aggregator.event_buffer),
            models,
            results_spec: results_queue_spec(&config.queues.results),
            stats_spec: stats_queue_spec(&config.queues.stats),
            dashboard_spec: dashboard_queue_spec(&config.queues.dashboard),
            config: config.aggregator.clone(),
            connector,
            metrics,
        }
    }

    pub fn hub(&self) -> &DashboardHub {
        &self.hub
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.hub.subscribe()
    }

    pub async fn snapshot(&self) -> AggregateSnapshot {
        self.store.lock().await.snapshot()
    }

    fn spec(&self, stream: InboundStream) -> &QueueSpec {
        match stream {
            InboundStream::Results => &self.results_spec,
            InboundStream::Stats => &self.stats_spec,
            InboundStream::ModelChanges => &self.dashboard_spec,
        }
    }

    /// 看板的 resetMetrics 命令
    pub async fn reset_metrics(&self) -> AggregateSnapshot {
        let snapshot = {
            let mut store = self.store.lock().await;
            store.reset();
            store.snapshot()
        };
        info!("指标已手动重置");
        self.hub
            .publish(DashboardEvent::MetricsUpdate(Box::new(snapshot.clone())));
        snapshot
    }

    pub async fn handle_result(&self, data: &[u8]) -> SimulationResult<ResultOutcome> {
        let result: ScenarioResult = serde_json::from_slice(data)?;
        let (outcome, snapshot) = {
            let mut store = self.store.lock().await;
            let outcome = store.record_result(&result);
            let snapshot = (outcome == ResultOutcome::Accepted).then(|| store.snapshot());
            (outcome, snapshot)
        };

        match snapshot {
            Some(snapshot) => {
                self.metrics.record_result_aggregated();
                self.hub.publish(DashboardEvent::Result(result));
                self.hub
                    .publish(DashboardEvent::MetricsUpdate(Box::new(snapshot)));
            }
            None => {
                self.metrics.record_duplicate_result();
                debug!(scenario_id = %result.scenario_id, "重复的结果，已忽略");
            }
        }
        Ok(outcome)
    }

    pub async fn handle_stats(&self, data: &[u8]) -> SimulationResult<()> {
        let stats: WorkerStats = serde_json::from_slice(data)?;
        self.store.lock().await.record_stats(stats.clone());
        self.hub.publish(DashboardEvent::Stats(stats));
        Ok(())
    }

    pub async fn handle_model_event(&self, data: &[u8]) -> SimulationResult<()> {
        let event = match serde_json::from_slice::<BusEvent>(data)? {
            BusEvent::ModelChanged(event) => event,
            other => {
                debug!("忽略看板总线事件: {:?}", other);
                return Ok(());
            }
        };

        let snapshot = {
            let mut store = self.store.lock().await;
            store.model_changed(&event);
            store.snapshot()
        };
        info!(
            version = %short_version(&event.new_version),
            model_label = %event.model_label,
            "检测到模型变更，指标已重置"
        );
        self.hub.publish(DashboardEvent::ModelChanged(event));
        self.hub
            .publish(DashboardEvent::MetricsUpdate(Box::new(snapshot)));
        Ok(())
    }

    async fn dispatch(&self, stream: InboundStream, data: &[u8]) -> SimulationResult<()> {
        match stream {
            InboundStream::Results => self.handle_result(data).await.map(|_| ()),
            InboundStream::Stats => self.handle_stats(data).await,
            InboundStream::ModelChanges => self.handle_model_event(data).await,
        }
    }

    /// 空闲超过阈值时发出一次结束事件
    pub async fn check_idle(&self) -> Option<SimulationFinishedEvent> {
        let threshold = Duration::from_secs(self.config.idle_threshold_seconds);
        let event = self.store.lock().await.check_finished(threshold)?;
        info!(
            total_processed = event.total_processed,
            total_errors = event.total_errors,
            "超过 {} 秒没有新结果，模拟已结束",
            threshold.as_secs()
        );
        self.hub
            .publish(DashboardEvent::SimulationFinished(event.clone()));
        Some(event)
    }

    /// 窥视模型槽位并刷新快照中的模型信息
    pub async fn probe_model_slot(&self) -> SlotObservation {
        let observation = match self.models.slot_status().await {
            Ok(SlotStatus::Missing) => SlotObservation::Missing,
            Ok(SlotStatus::Present {
                message_count,
                model,
            }) => SlotObservation::Active {
                message_count,
                version: model.map(|model| model.version),
            },
            Err(e) => {
                debug!("探测模型槽位失败: {}", e);
                SlotObservation::Error(e.to_string())
            }
        };

        let snapshot = {
            let mut store = self.store.lock().await;
            store.apply_slot_observation(observation.clone());
            store.snapshot()
        };
        self.hub
            .publish(DashboardEvent::MetricsUpdate(Box::new(snapshot)));
        observation
    }

    /// 启动三个监听器、看门狗和模型探针
    pub fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = InboundStream::ALL
            .into_iter()
            .map(|stream| {
                let aggregator = Arc::clone(self);
                let rx = shutdown_rx.resubscribe();
                tokio::spawn(async move { aggregator.listen(stream, rx).await })
            })
            .collect();

        let aggregator = Arc::clone(self);
        let rx = shutdown_rx.resubscribe();
        handles.push(tokio::spawn(async move { aggregator.run_watchdog(rx).await }));

        let aggregator = Arc::clone(self);
        handles.push(tokio::spawn(
            async move { aggregator.run_model_probe(shutdown_rx).await },
        ));
        info!("聚合服务已启动");
        handles
    }

    pub async fn listen(&self, stream: InboundStream, mut shutdown_rx: broadcast::Receiver<()>) {
        let spec = self.spec(stream).clone();
        let mut retry =
            RetryPolicy::fixed(Duration::from_secs(self.config.reconnect_delay_seconds)).start();
        loop {
            let link = BrokerLink::new(self.connector.clone());
            let outcome = self.listen_once(&link, &spec, stream, &mut shutdown_rx).await;
            if let Err(e) = link.close().await {
                debug!(queue = %spec.name, "关闭监听通道失败: {}", e);
            }
            match outcome {
                Ok(ListenOutcome::Shutdown) => break,
                Ok(ListenOutcome::StreamEnded) => {
                    warn!(queue = %spec.name, "消费流已结束，准备重连");
                }
                Err(e) => warn!(queue = %spec.name, "监听失败: {}", e),
            }

            let delay = retry.next_delay().unwrap_or(Duration::from_secs(3));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        info!(queue = %spec.name, "监听器已停止");
    }

    async fn listen_once(
        &self,
        link: &BrokerLink,
        spec: &QueueSpec,
        stream: InboundStream,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SimulationResult<ListenOutcome> {
        let (channel, state) = link.ensure_queue(spec).await?;
        let mut deliveries = channel.consume(&spec.name, stream.consumer_tag()).await?;
        info!(
            queue = %spec.name,
            "开始监听，队列中 {} 条消息",
            state.message_count
        );

        loop {
            tokio::select! {
                next = deliveries.next() => {
                    let Some(delivery) = next else {
                        return Ok(ListenOutcome::StreamEnded);
                    };
                    let delivery = delivery?;
                    if let Err(e) = self.dispatch(stream, &delivery.data).await {
                        warn!(queue = %spec.name, "无法处理消息，已丢弃: {}", e);
                        self.metrics.record_dropped_message(&spec.name);
                    }
                    channel.ack(delivery.delivery_tag).await?;
                }
                _ = shutdown_rx.recv() => return Ok(ListenOutcome::Shutdown),
            }
        }
    }

    async fn run_watchdog(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.watchdog_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.check_idle().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("空闲检测已停止");
    }

    async fn run_model_probe(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.config.model_probe_interval_seconds.max(1),
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.probe_model_slot().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        if let Err(e) = self.models.close().await {
            debug!("关闭模型通道失败: {}", e);
        }
        debug!("模型槽位探针已停止");
    }
}
