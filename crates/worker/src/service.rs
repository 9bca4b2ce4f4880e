//! Monte Carlo Worker
//!
//! 启动时从模型槽位获取模型并做一次冒烟调用，然后以预取 1 消费场景队列。
//! 每个场景处理前先检查更新信号和场景上的版本标记，必要时重新加载模型；
//! 结果尽力发布后才确认消息，进程在处理中途崩溃时代理会重新投递。

use futures::StreamExt;
use montecarlo_config::{AppConfig, WorkerConfig};
use montecarlo_domain::{model::short_version, ModelVersion, Scenario, ScenarioResult, ScenarioSampler};
use montecarlo_errors::{SimulationError, SimulationResult};
use montecarlo_infrastructure::{
    results_publish_options, results_queue_spec, stats_queue_spec, work_queue_spec,
    BrokerChannel, BrokerConnector, BrokerLink, Delivery, JsonPublisher, ModelChannel,
    PublishOptions, QueueSpec, RetryPolicy, UpdateBus, UpdateSignal,
};
use montecarlo_observability::MetricsCollector;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::evaluator::{ModelEvaluator, ModelFunction};
use crate::state::WorkerState;
use crate::stats::{WorkerCounters, WorkerSummary};

/// 已编译并通过冒烟调用的模型
#[derive(Clone)]
pub struct LoadedModel {
    pub version: ModelVersion,
    function: Arc<dyn ModelFunction>,
}

impl LoadedModel {
    pub fn function(&self) -> Arc<dyn ModelFunction> {
        self.function.clone()
    }
}

/// 触发重新加载的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// 更新总线上收到的新版本
    Notification(String),
    /// 场景上标记的版本与本地不一致
    ScenarioTag(String),
}

impl ReloadTrigger {
    fn version(&self) -> &str {
        match self {
            ReloadTrigger::Notification(version) | ReloadTrigger::ScenarioTag(version) => version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Stopped,
    StreamEnded,
}

pub struct MonteCarloWorker {
    worker_id: String,
    config: WorkerConfig,
    link: BrokerLink,
    work_spec: QueueSpec,
    models: ModelChannel,
    updates: UpdateBus,
    signal: Arc<UpdateSignal>,
    results: JsonPublisher,
    stats: JsonPublisher,
    evaluator: Arc<dyn ModelEvaluator>,
    sampler: ScenarioSampler,
    state: Mutex<WorkerState>,
    loaded: Mutex<Option<LoadedModel>>,
    /// 最近一次按场景标记重载后仍拿不到的版本，避免旧积压场景反复触发等待
    unreachable_tag: Mutex<Option<String>>,
    counters: WorkerCounters,
    running: Arc<RwLock<bool>>,
    metrics: Arc<MetricsCollector>,
}

impl MonteCarloWorker {
    pub fn new(
        worker_id: impl Into<String>,
        connector: Arc<dyn BrokerConnector>,
        config: &AppConfig,
        evaluator: Arc<dyn ModelEvaluator>,
        metrics: Arc<MetricsCollector>,
    ) -> SimulationResult<Self> {
        Ok(Self {
            worker_id: worker_id.into(),
            config: config.worker.clone(),
            link: BrokerLink::new(connector.clone()),
            work_spec: work_queue_spec(&config.queues.scenarios, &config.producer),
            models: ModelChannel::new(connector.clone(), &config.queues.model, config.model.clone()),
            updates: UpdateBus::new(connector.clone(), &config.queues.updates),
            signal: Arc::new(UpdateSignal::new()),
            results: JsonPublisher::new(
                connector.clone(),
                results_queue_spec(&config.queues.results),
                results_publish_options(),
            ),
            stats: JsonPublisher::new(
                connector,
                stats_queue_spec(&config.queues.stats),
                PublishOptions::default(),
            ),
            evaluator,
            sampler: ScenarioSampler::new()?,
            state: Mutex::new(WorkerState::Uninitialized),
            loaded: Mutex::new(None),
            unreachable_tag: Mutex::new(None),
            counters: WorkerCounters::new(),
            running: Arc::new(RwLock::new(false)),
            metrics,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            warn!(worker_id = %self.worker_id, "非预期的状态转换: {} -> {}", *state, next);
        }
        debug!(worker_id = %self.worker_id, "状态: {} -> {}", *state, next);
        *state = next;
    }

    pub fn loaded_model(&self) -> Option<LoadedModel> {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current_version(&self) -> Option<String> {
        self.loaded_model().map(|model| model.version.version)
    }

    pub fn counters(&self) -> &WorkerCounters {
        &self.counters
    }

    /// 更新总线监听器写入的信号
    pub fn update_signal(&self) -> Arc<UpdateSignal> {
        self.signal.clone()
    }

    /// 编译模型并用一个随机场景做冒烟调用
    pub fn prepare_model(&self, model: &ModelVersion) -> SimulationResult<Arc<dyn ModelFunction>> {
        let function = self.evaluator.compile(&model.source_text)?;
        let probe = self
            .sampler
            .scenario(&mut rand::rng(), 0, Some(&model.version));
        function.invoke(&probe).map_err(|e| {
            SimulationError::ModelVerification(format!(
                "模型 {} 冒烟调用失败: {}",
                model.short_id(),
                e
            ))
        })?;
        Ok(function)
    }

    fn install(&self, version: ModelVersion, function: Arc<dyn ModelFunction>) {
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = Some(LoadedModel {
            version,
            function,
        });
    }

    /// 启动阶段获取模型，任何失败都是致命的
    pub async fn initialize(&self) -> SimulationResult<ModelVersion> {
        self.set_state(WorkerState::AcquiringModel);
        let wait = Duration::from_secs(self.config.startup_wait_seconds);
        info!(
            worker_id = %self.worker_id,
            evaluator = self.evaluator.name(),
            "等待模型，最长 {} 秒",
            wait.as_secs()
        );

        let result = async {
            let model = self.models.try_acquire(wait).await?;
            let function = self.prepare_model(&model)?;
            Ok::<_, SimulationError>((model, function))
        }
        .await;

        match result {
            Ok((model, function)) => {
                info!(worker_id = %self.worker_id, version = %model.short_id(), "模型已加载");
                self.install(model.clone(), function);
                self.set_state(WorkerState::Ready);
                Ok(model)
            }
            Err(e) => {
                error!(worker_id = %self.worker_id, "无法加载初始模型: {}", e);
                self.set_state(WorkerState::Stopped);
                Err(e)
            }
        }
    }

    /// 热重载，失败时保留原模型；返回是否切换了版本
    pub async fn reload_model(&self, trigger: ReloadTrigger) -> bool {
        let previous = self.state();
        self.set_state(WorkerState::ReloadingModel);
        info!(
            worker_id = %self.worker_id,
            target = %short_version(trigger.version()),
            "重新加载模型: {:?}",
            trigger
        );

        let wait = Duration::from_secs(self.config.reload_wait_seconds);
        let switched = match self.models.try_acquire(wait).await {
            Ok(model) if Some(&model.version) == self.current_version().as_ref() => {
                debug!(worker_id = %self.worker_id, version = %model.short_id(), "模型槽位仍是当前版本");
                false
            }
            Ok(model) => match self.prepare_model(&model) {
                Ok(function) => {
                    info!(worker_id = %self.worker_id, version = %model.short_id(), "已切换到新模型");
                    self.install(model, function);
                    self.metrics.record_model_reload();
                    true
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id, version = %model.short_id(), "新模型不可用，保留当前模型: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!(worker_id = %self.worker_id, "重新加载模型失败，保留当前模型: {}", e);
                false
            }
        };

        if let ReloadTrigger::ScenarioTag(tag) = &trigger {
            let reached = self.current_version().as_deref() == Some(tag.as_str());
            *self.unreachable_tag.lock().unwrap_or_else(|e| e.into_inner()) =
                (!reached).then(|| tag.clone());
        }

        let resume = if previous == WorkerState::ReloadingModel {
            WorkerState::Consuming
        } else {
            previous
        };
        self.set_state(resume);
        switched
    }

    /// 该标记已确认无法从槽位取得时，同标记的场景不再重载，直接用当前模型处理。
    /// 槽位不会再出现已退役的版本，重复重载只会空等 `reload_wait_seconds`。
    fn tag_is_unreachable(&self, tag: &str) -> bool {
        self.unreachable_tag
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            == Some(tag)
    }

    /// 处理单个场景，模型错误写入结果而不向上传播
    pub async fn process(&self, scenario: &Scenario) -> ScenarioResult {
        if let Some(version) = self.signal.check_and_clear() {
            self.reload_model(ReloadTrigger::Notification(version)).await;
        }
        if scenario.targets_other_version(self.current_version().as_deref()) {
            if let Some(tag) = scenario.model_version.as_deref() {
                if !self.tag_is_unreachable(tag) {
                    self.reload_model(ReloadTrigger::ScenarioTag(tag.to_string()))
                        .await;
                }
            }
        }

        let Some(model) = self.loaded_model() else {
            let result = ScenarioResult::failure(&self.worker_id, scenario, "没有可用的模型", 0.0, None);
            self.counters.record(false);
            self.metrics.record_scenario_processed(false, 0.0);
            return result;
        };

        let started = Instant::now();
        let outcome = model.function.invoke(scenario);
        let duration = started.elapsed().as_secs_f64();
        let version = Some(model.version.version.clone());

        let result = match outcome {
            Ok(output) => ScenarioResult::success(&self.worker_id, scenario, output, duration, version),
            Err(e) => {
                debug!(worker_id = %self.worker_id, scenario_id = %scenario.id, "场景计算失败: {}", e);
                let message = match e {
                    SimulationError::Processing(message) => message,
                    other => other.to_string(),
                };
                ScenarioResult::failure(&self.worker_id, scenario, message, duration, version)
            }
        };
        self.counters.record(result.success);
        self.metrics.record_scenario_processed(result.success, duration);
        result
    }

    async fn handle_delivery(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> SimulationResult<()> {
        let scenario = match serde_json::from_slice::<Scenario>(&delivery.data) {
            Ok(scenario) => scenario,
            Err(e) => {
                warn!(worker_id = %self.worker_id, "场景消息格式错误，已丢弃: {}", e);
                self.metrics.record_dropped_message(&self.work_spec.name);
                return channel.nack(delivery.delivery_tag, false).await;
            }
        };

        let result = self.process(&scenario).await;
        self.results.publish_best_effort(&result).await;
        channel.ack(delivery.delivery_tag).await?;

        let processed = self.counters.processed();
        if processed % self.config.progress_log_every.max(1) == 0 {
            info!(
                worker_id = %self.worker_id,
                "已处理 {} 个场景 | 速率: {:.2}/s | 错误: {}",
                processed,
                self.counters.rate(),
                self.counters.errors()
            );
        }
        Ok(())
    }

    pub async fn publish_stats(&self) -> bool {
        let stats = self.counters.snapshot(&self.worker_id, self.current_version());
        self.stats.publish_best_effort(&stats).await
    }

    /// 连接场景队列，超过配置的次数后放弃
    async fn open_work_queue(&self) -> SimulationResult<()> {
        let policy = RetryPolicy::bounded(
            self.config.consume_attempts,
            Duration::from_secs(self.config.consume_retry_delay_seconds),
        );
        policy
            .run("连接场景队列", |_| async {
                self.link.ensure_queue(&self.work_spec).await.map(|_| ())
            })
            .await
    }

    async fn consume_session(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SimulationResult<SessionEnd> {
        let (channel, state) = self.link.ensure_queue(&self.work_spec).await?;
        channel.set_prefetch(1).await?;
        let mut deliveries = channel
            .consume(&self.work_spec.name, &self.worker_id)
            .await?;
        info!(
            worker_id = %self.worker_id,
            queue = %self.work_spec.name,
            "开始消费场景，队列中 {} 条消息",
            state.message_count
        );

        let period = Duration::from_secs(self.config.stats_interval_seconds.max(1));
        let mut stats_tick = tokio::time::interval_at(Instant::now() + period, period);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = deliveries.next() => {
                    let Some(delivery) = next else {
                        return Ok(SessionEnd::StreamEnded);
                    };
                    self.handle_delivery(channel.as_ref(), delivery?).await?;
                    if !self.is_running().await {
                        return Ok(SessionEnd::Stopped);
                    }
                }
                _ = stats_tick.tick() => {
                    self.publish_stats().await;
                    if !self.is_running().await {
                        return Ok(SessionEnd::Stopped);
                    }
                }
                _ = shutdown_rx.recv() => return Ok(SessionEnd::Shutdown),
            }
        }
    }

    /// 完整的 Worker 生命周期，正常停止时返回运行摘要
    ///
    /// 初始模型获取失败或场景队列无法连接时返回错误，调用方应以非零状态退出。
    pub async fn run(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> SimulationResult<WorkerSummary> {
        *self.running.write().await = true;
        if let Err(e) = self.initialize().await {
            *self.running.write().await = false;
            return Err(e);
        }
        if let Err(e) = self.open_work_queue().await {
            error!(worker_id = %self.worker_id, "无法连接场景队列: {}", e);
            self.set_state(WorkerState::Stopped);
            *self.running.write().await = false;
            return Err(e);
        }

        let listener = self
            .updates
            .listener(
                &self.worker_id,
                self.signal.clone(),
                Duration::from_secs(self.config.update_listener_reconnect_seconds),
            )
            .spawn(shutdown_rx.resubscribe());
        self.set_state(WorkerState::Consuming);

        let reconnect_delay = Duration::from_secs(self.config.reconnect_delay_seconds);
        loop {
            match self.consume_session(&mut shutdown_rx).await {
                Ok(SessionEnd::Shutdown) => {
                    info!(worker_id = %self.worker_id, "收到关闭信号");
                    break;
                }
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::StreamEnded) => {
                    warn!(worker_id = %self.worker_id, "场景消费流已结束，准备重连");
                    self.link.reset().await;
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id, "消费场景失败: {}", e);
                    self.link.reset().await;
                }
            }
            if !self.is_running().await {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        Ok(self.shutdown(listener).await)
    }

    async fn shutdown(&self, listener: JoinHandle<()>) -> WorkerSummary {
        listener.abort();
        if let Err(e) = listener.await {
            if !e.is_cancelled() {
                warn!(worker_id = %self.worker_id, "更新总线监听器异常退出: {}", e);
            }
        }

        self.publish_stats().await;
        self.set_state(WorkerState::Stopped);
        *self.running.write().await = false;

        for (name, result) in [
            ("results", self.results.close().await),
            ("stats", self.stats.close().await),
            ("model", self.models.close().await),
            ("updates", self.updates.close().await),
            ("scenarios", self.link.close().await),
        ] {
            if let Err(e) = result {
                debug!(worker_id = %self.worker_id, "关闭 {} 通道失败: {}", name, e);
            }
        }

        let summary = self.counters.summary(&self.worker_id);
        info!(
            worker_id = %self.worker_id,
            processed = summary.processed,
            errors = summary.errors,
            "{}",
            summary
        );
        summary
    }

    /// 停止信号在下一个场景或统计周期边界生效
    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!(worker_id = %self.worker_id, "Worker 已请求停止");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ExpressionEvaluator, MockModelEvaluator};
    use montecarlo_infrastructure::InMemoryBroker;
    use montecarlo_testing_utils::{small_config, ScenarioBuilder, SIMPLE_MODEL};
    use serde_json::{json, Map, Value};

    struct Constant(f64);

    impl ModelFunction for Constant {
        fn invoke(&self, _: &Scenario) -> SimulationResult<Map<String, Value>> {
            let mut output = Map::new();
            output.insert("value".to_string(), json!(self.0));
            Ok(output)
        }
    }

    struct Failing;

    impl ModelFunction for Failing {
        fn invoke(&self, _: &Scenario) -> SimulationResult<Map<String, Value>> {
            Err(SimulationError::processing("boom"))
        }
    }

    fn worker(broker: &InMemoryBroker, evaluator: Arc<dyn ModelEvaluator>) -> MonteCarloWorker {
        MonteCarloWorker::new(
            "w-test",
            Arc::new(broker.clone()),
            &small_config(),
            evaluator,
            Arc::new(MetricsCollector::new()),
        )
        .unwrap()
    }

    fn models(broker: &InMemoryBroker) -> ModelChannel {
        let config = small_config();
        ModelChannel::new(Arc::new(broker.clone()), &config.queues.model, config.model)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_compiles_and_smoke_tests() {
        let broker = InMemoryBroker::new();
        let published = models(&broker).publish("source-a").await.unwrap();

        let mut evaluator = MockModelEvaluator::new();
        evaluator
            .expect_compile()
            .withf(|source| source == "source-a")
            .times(1)
            .returning(|_| Ok(Arc::new(Constant(1.0)) as Arc<dyn ModelFunction>));
        evaluator.expect_name().return_const("mock");

        let worker = worker(&broker, Arc::new(evaluator));
        let model = worker.initialize().await.unwrap();
        assert_eq!(model.version, published.version);
        assert_eq!(worker.state(), WorkerState::Ready);
        assert_eq!(worker.current_version(), Some(published.version));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_rejects_model_failing_smoke_call() {
        let broker = InMemoryBroker::new();
        models(&broker).publish("broken").await.unwrap();

        let mut evaluator = MockModelEvaluator::new();
        evaluator
            .expect_compile()
            .returning(|_| Ok(Arc::new(Failing) as Arc<dyn ModelFunction>));
        evaluator.expect_name().return_const("mock");

        let worker = worker(&broker, Arc::new(evaluator));
        let err = worker.initialize().await.unwrap_err();
        assert!(matches!(err, SimulationError::ModelVerification(_)));
        assert!(err.is_fatal_at_startup());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_propagates_compilation_error() {
        let broker = InMemoryBroker::new();
        models(&broker).publish("no entry").await.unwrap();

        let mut evaluator = MockModelEvaluator::new();
        evaluator
            .expect_compile()
            .returning(|_| Err(SimulationError::compilation("缺少入口")));
        evaluator.expect_name().return_const("mock");

        let worker = worker(&broker, Arc::new(evaluator));
        let err = worker.initialize().await.unwrap_err();
        assert!(matches!(err, SimulationError::Compilation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_times_out_without_model() {
        let broker = InMemoryBroker::new();
        let worker = worker(&broker, Arc::new(ExpressionEvaluator::default()));

        let started = Instant::now();
        let err = worker.initialize().await.unwrap_err();
        assert!(matches!(err, SimulationError::AcquisitionTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tag_triggers_reload_before_processing() {
        let broker = InMemoryBroker::new();
        let owner = models(&broker);
        owner.publish("[model_fn]\nvalue = 1\n").await.unwrap();

        let worker = worker(&broker, Arc::new(ExpressionEvaluator::default()));
        worker.initialize().await.unwrap();

        let v2 = owner.publish("[model_fn]\nvalue = 2\n").await.unwrap();
        let scenario = ScenarioBuilder::new().with_model_version(&v2.version).build();

        let result = worker.process(&scenario).await;
        assert!(result.success);
        assert_eq!(result.result["value"], 2.0);
        assert_eq!(result.model_version.as_deref(), Some(v2.version.as_str()));
        assert_eq!(worker.current_version(), Some(v2.version));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_signal_triggers_reload() {
        let broker = InMemoryBroker::new();
        let owner = models(&broker);
        owner.publish("[model_fn]\nvalue = 1\n").await.unwrap();

        let worker = worker(&broker, Arc::new(ExpressionEvaluator::default()));
        let v1 = worker.initialize().await.unwrap();
        let v2 = owner.publish("[model_fn]\nvalue = 2\n").await.unwrap();
        worker.update_signal().raise(v2.version.clone());

        // 场景仍标记旧版本，信号优先
        let scenario = ScenarioBuilder::new().with_model_version(&v1.version).build();
        let result = worker.process(&scenario).await;
        assert_eq!(result.result["value"], 2.0);
        assert!(!worker.update_signal().is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_keeps_prior_model() {
        let broker = InMemoryBroker::new();
        let owner = models(&broker);
        owner.publish("[model_fn]\nvalue = 1\n").await.unwrap();

        let worker = worker(&broker, Arc::new(ExpressionEvaluator::default()));
        let v1 = worker.initialize().await.unwrap();
        let broken = owner.publish("[model_fn]\nvalue = 1 / 0\n").await.unwrap();

        let scenario = ScenarioBuilder::new().with_model_version(&broken.version).build();
        let result = worker.process(&scenario).await;
        assert!(result.success);
        assert_eq!(result.result["value"], 1.0);
        assert_eq!(worker.current_version(), Some(v1.version));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_tag_is_not_retried() {
        let broker = InMemoryBroker::new();
        let owner = models(&broker);
        owner.publish(SIMPLE_MODEL).await.unwrap();

        let worker = worker(&broker, Arc::new(ExpressionEvaluator::default()));
        worker.initialize().await.unwrap();

        let scenario = || ScenarioBuilder::new().with_model_version("retired").build();
        worker.process(&scenario()).await;

        // 槽位清空后，同一个旧标记不应再等待 reload_wait
        let raw = broker.connect().await.unwrap();
        raw.delete_queue(owner.queue_name()).await.unwrap();
        let started = Instant::now();
        let result = worker.process(&scenario()).await;
        assert!(result.success);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_error_becomes_failed_result() {
        let broker = InMemoryBroker::new();
        models(&broker)
            .publish("[model_fn]\nratio = 10 / (index - 3)\n")
            .await
            .unwrap();

        let worker = worker(&broker, Arc::new(ExpressionEvaluator::default()));
        worker.initialize().await.unwrap();
        let version = worker.current_version();

        let scenario = ScenarioBuilder::new()
            .with_index(3)
            .with_model_version(version.as_deref().unwrap())
            .build();
        let result = worker.process(&scenario).await;
        assert!(!result.success);
        assert!(result.error_message().unwrap().contains("ratio"));
        assert_eq!(worker.counters().errors(), 1);
        assert_eq!(worker.counters().processed(), 1);
    }
}
