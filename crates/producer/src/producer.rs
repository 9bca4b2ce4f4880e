//! 自适应场景生产
//!
//! 每个周期读取工作队列的深度和消费者数量，按水位补充场景：
//! 深度低于最小值时补 `min(最小值 - 深度, 批量)`；有消费者且深度低于最小值一半时加倍，
//! 上限为两倍批量。队列已满时什么也不做，代理的 reject-publish 保证长度不超过上限。

use montecarlo_config::ProducerConfig;
use montecarlo_domain::{model::short_version, ScenarioSampler};
use montecarlo_errors::{SimulationError, SimulationResult};
use montecarlo_infrastructure::{
    work_queue_spec, BrokerConnector, BrokerLink, JsonPublisher, PublishOptions, QueueSpec,
    QueueState, RetryPolicy,
};
use montecarlo_observability::MetricsCollector;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 一个生产周期的计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    pub to_publish: u32,
    pub pause: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub queue: QueueState,
    pub published: u32,
    pub pause: Duration,
}

pub fn plan_cycle(config: &ProducerConfig, state: QueueState) -> CyclePlan {
    let depth = state.message_count;
    let critical = depth < config.min_scenarios / 2;
    let pause = if critical {
        Duration::from_millis(config.fast_tick_ms)
    } else {
        Duration::from_millis(config.slow_tick_ms)
    };

    if depth >= config.min_scenarios {
        return CyclePlan {
            to_publish: 0,
            pause,
        };
    }

    let mut needed = (config.min_scenarios - depth).min(config.batch_size);
    if state.consumer_count > 0 && critical {
        needed = needed
            .saturating_mul(2)
            .min(config.batch_size.saturating_mul(2));
    }
    let room = config.max_scenarios.saturating_sub(depth);

    CyclePlan {
        to_publish: needed.min(room),
        pause,
    }
}

pub struct ScenarioProducer {
    link: BrokerLink,
    publisher: JsonPublisher,
    spec: QueueSpec,
    config: ProducerConfig,
    sampler: ScenarioSampler,
    model_version: Mutex<Option<String>>,
    total_published: AtomicU64,
    running: Arc<RwLock<bool>>,
    metrics: Arc<MetricsCollector>,
}

impl ScenarioProducer {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        queue_name: &str,
        config: ProducerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> SimulationResult<Self> {
        let spec = work_queue_spec(queue_name, &config);
        Ok(Self {
            link: BrokerLink::new(connector.clone()),
            publisher: JsonPublisher::new(connector, spec.clone(), PublishOptions::persistent()),
            spec,
            config,
            sampler: ScenarioSampler::new()?,
            model_version: Mutex::new(None),
            total_published: AtomicU64::new(0),
            running: Arc::new(RwLock::new(false)),
            metrics,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.spec.name
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn total_published(&self) -> u64 {
        self.total_published.load(Ordering::SeqCst)
    }

    pub fn model_version(&self) -> Option<String> {
        self.model_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 之后生成的场景都带上这个模型版本
    pub fn set_model_version(&self, version: Option<String>) {
        if let Some(version) = &version {
            info!(version = %short_version(version), "场景生产切换到新模型版本");
        }
        *self.model_version.lock().unwrap_or_else(|e| e.into_inner()) = version;
    }

    /// 声明工作队列，参数不一致的已有队列视为成功
    pub async fn configure_queue(&self) -> SimulationResult<QueueState> {
        let policy = RetryPolicy::bounded(
            self.config.configure_attempts,
            Duration::from_secs(self.config.configure_retry_delay_seconds),
        );
        let state = policy
            .run("配置场景队列", |_| self.declare_work_queue())
            .await?;
        info!(
            queue = %self.spec.name,
            max_length = self.config.max_scenarios,
            "场景队列配置完成，当前 {} 条消息",
            state.message_count
        );
        Ok(state)
    }

    async fn declare_work_queue(&self) -> SimulationResult<QueueState> {
        let channel = self.link.connect().await?;
        match channel.declare_queue(&self.spec).await {
            Ok(state) => Ok(state),
            Err(SimulationError::PreconditionFailed(msg)) => {
                warn!(queue = %self.spec.name, "队列已以不同参数存在，沿用现有队列: {}", msg);
                // 声明失败后代理已关闭该通道
                let channel = self.link.reconnect().await?;
                channel.inspect_queue(&self.spec.name).await
            }
            Err(e) => {
                self.link.reset().await;
                Err(e)
            }
        }
    }

    /// 读取工作队列的深度和消费者数量
    pub async fn queue_state(&self) -> SimulationResult<QueueState> {
        let result = async {
            let channel = self.link.connect().await?;
            channel.inspect_queue(&self.spec.name).await
        }
        .await;
        if result.is_err() {
            self.link.reset().await;
        }
        result
    }

    /// 生成并逐条发布 count 个场景，返回实际发布的数量
    ///
    /// 队列满时停止本批次。传输错误在没有任何进展时返回错误，部分成功时返回已发布数量。
    pub async fn publish_batch(&self, count: u32) -> SimulationResult<u32> {
        if count == 0 {
            return Ok(0);
        }
        let version = self.model_version();
        let start_index = self.total_published();
        let scenarios = self
            .sampler
            .batch(start_index, count as usize, version.as_deref());

        let mut published = 0u32;
        for scenario in &scenarios {
            match self.publisher.publish(scenario).await {
                Ok(()) => {
                    published += 1;
                    self.total_published.fetch_add(1, Ordering::SeqCst);
                }
                Err(SimulationError::PublishRejected(_)) => {
                    self.metrics.record_publish_rejection(&self.spec.name);
                    debug!(queue = %self.spec.name, "队列已满，本批次提前结束");
                    break;
                }
                Err(e) if published == 0 => return Err(e),
                Err(e) => {
                    warn!(
                        queue = %self.spec.name,
                        "批次发布中断，已发布 {}/{}: {}",
                        published, count, e
                    );
                    break;
                }
            }
        }
        self.metrics.record_scenarios_published(published as u64);
        Ok(published)
    }

    /// 启动前一次性补到最小水位
    pub async fn initial_fill(&self) -> SimulationResult<u32> {
        let state = self.queue_state().await.unwrap_or_default();
        let needed = self
            .config
            .min_scenarios
            .saturating_sub(state.message_count)
            .min(self.config.max_scenarios.saturating_sub(state.message_count));
        if needed == 0 {
            return Ok(0);
        }
        let published = self.publish_batch(needed).await?;
        info!(
            "初始填充完成: +{} 场景 | 总计: {}",
            published,
            self.total_published()
        );
        Ok(published)
    }

    pub async fn production_cycle(&self) -> SimulationResult<CycleReport> {
        let state = match self.queue_state().await {
            Ok(state) => state,
            Err(e) => {
                debug!(queue = %self.spec.name, "读取队列状态失败，按空队列处理: {}", e);
                QueueState::default()
            }
        };
        self.metrics
            .update_work_queue(state.message_count, state.consumer_count);

        let plan = plan_cycle(&self.config, state);
        let published = self.publish_batch(plan.to_publish).await?;
        if published > 0 {
            info!(
                "+{} 场景 | 总计: {} | 队列: {} | 消费者: {}",
                published,
                self.total_published(),
                state.message_count + published,
                state.consumer_count
            );
        }
        Ok(CycleReport {
            queue: state,
            published,
            pause: plan.pause,
        })
    }

    /// 在后台运行生产循环
    pub async fn start(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        *self.running.write().await = true;
        let producer = Arc::clone(self);
        tokio::spawn(async move { producer.run(shutdown_rx).await })
    }

    /// 停止信号在周期边界生效，不会打断正在进行的发布
    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("场景生产已请求停止");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        *self.running.write().await = true;
        info!(queue = %self.spec.name, "场景生产循环已启动");

        let mut failures = 0u32;
        while self.is_running().await {
            let pause = match self.production_cycle().await {
                Ok(report) => {
                    failures = 0;
                    report.pause
                }
                Err(e) => {
                    failures += 1;
                    warn!("生产周期失败 (连续{}次): {}", failures, e);
                    if failures >= self.config.failure_threshold {
                        error!(
                            "连续失败 {} 次，暂停生产 {} 秒",
                            failures, self.config.failure_backoff_seconds
                        );
                        failures = 0;
                        Duration::from_secs(self.config.failure_backoff_seconds)
                    } else {
                        Duration::from_millis(self.config.slow_tick_ms)
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_rx.recv() => {
                    info!("场景生产循环收到关闭信号");
                    break;
                }
            }
        }

        *self.running.write().await = false;
        info!("场景生产循环已停止，共发布 {} 个场景", self.total_published());
    }

    pub async fn close(&self) -> SimulationResult<()> {
        self.publisher.close().await?;
        self.link.close().await
    }
}
