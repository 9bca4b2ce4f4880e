use std::sync::Arc;
use std::time::Duration;

use montecarlo_config::AppConfig;
use montecarlo_domain::{ScenarioResult, ScenarioSampler, WorkerStats};
use montecarlo_errors::SimulationError;
use montecarlo_infrastructure::{
    work_queue_spec, InMemoryBroker, JsonPublisher, ModelChannel, PublishOptions, UpdateBus,
};
use montecarlo_observability::MetricsCollector;
use montecarlo_testing_utils::{small_config, TestEnv, SIMPLE_MODEL};
use montecarlo_worker::{
    EvaluatorPolicy, ExpressionEvaluator, ModelEvaluator, MonteCarloWorker, WorkerState,
};
use tokio::sync::broadcast;

struct Harness {
    broker: InMemoryBroker,
    config: AppConfig,
    models: ModelChannel,
    scenarios: JsonPublisher,
}

impl Harness {
    fn new() -> Self {
        let broker = InMemoryBroker::new();
        let config = small_config();
        let models = ModelChannel::new(
            Arc::new(broker.clone()),
            &config.queues.model,
            config.model.clone(),
        );
        let scenarios = JsonPublisher::new(
            Arc::new(broker.clone()),
            work_queue_spec(&config.queues.scenarios, &config.producer),
            PublishOptions::persistent(),
        );
        Self {
            broker,
            config,
            models,
            scenarios,
        }
    }

    fn worker(&self, worker_id: &str) -> Arc<MonteCarloWorker> {
        Arc::new(
            MonteCarloWorker::new(
                worker_id,
                Arc::new(self.broker.clone()),
                &self.config,
                Arc::new(ExpressionEvaluator::default()),
                Arc::new(MetricsCollector::new()),
            )
            .unwrap(),
        )
    }

    async fn publish_scenarios(&self, start: u64, count: usize, version: Option<&str>) {
        let sampler = ScenarioSampler::new().unwrap();
        for scenario in sampler.batch(start, count, version) {
            self.scenarios.publish(&scenario).await.unwrap();
        }
    }

    fn results(&self) -> Vec<ScenarioResult> {
        self.broker
            .peek_messages(&self.config.queues.results)
            .iter()
            .map(|data| serde_json::from_slice(data).unwrap())
            .collect()
    }

    fn stats(&self) -> Vec<WorkerStats> {
        self.broker
            .peek_messages(&self.config.queues.stats)
            .iter()
            .map(|data| serde_json::from_slice(data).unwrap())
            .collect()
    }

    async fn wait_for_results(&self, count: usize) -> bool {
        let (broker, queue) = (&self.broker, self.config.queues.results.as_str());
        TestEnv::wait_for(
            || async move {
                broker
                    .queue_state(queue)
                    .map(|state| state.message_count as usize >= count)
                    .unwrap_or(false)
            },
            Duration::from_secs(30),
        )
        .await
    }
}

#[tokio::test(start_paused = true)]
async fn test_worker_processes_scenarios_and_reports() {
    let harness = Harness::new();
    let model = harness.models.publish(SIMPLE_MODEL).await.unwrap();
    harness
        .publish_scenarios(0, 5, Some(&model.version))
        .await;

    let worker = harness.worker("w-1");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    assert!(harness.wait_for_results(5).await);
    assert_eq!(worker.state(), WorkerState::Consuming);

    let results = harness.results();
    assert_eq!(results.len(), 5);
    for result in &results {
        assert!(result.success);
        assert_eq!(result.consumer, "w-1");
        assert_eq!(result.model_version.as_deref(), Some(model.version.as_str()));
        assert!(result.result.get("value").is_some());
        assert!(result.result["high"].is_boolean());
    }
    // 全部确认后工作队列为空
    let work = harness.broker.queue_state("escenarios").unwrap();
    assert_eq!(work.message_count, 0);
    assert_eq!(work.consumer_count, 1);

    shutdown_tx.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.errors, 0);
    assert_eq!(worker.state(), WorkerState::Stopped);

    // 关闭时强制上报一次统计
    let stats = harness.stats();
    let last = stats.last().unwrap();
    assert_eq!(last.consumer, "w-1");
    assert_eq!(last.processed, 5);
    assert_eq!(harness.broker.queue_state("escenarios").unwrap().consumer_count, 0);
    assert!(!harness.broker.queue_exists("actualizaciones_modelo.w-1"));
}

#[tokio::test(start_paused = true)]
async fn test_worker_exits_when_no_model_arrives() {
    let harness = Harness::new();
    let worker = harness.worker("w-1");
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let err = worker.run(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, SimulationError::AcquisitionTimeout { .. }));
    assert!(err.is_fatal_at_startup());
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(!worker.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_worker_exits_on_broken_model() {
    let harness = Harness::new();
    harness
        .models
        .publish("[model_fn]\nvalue = missing_field * 2\n")
        .await
        .unwrap();
    let worker = harness.worker("w-1");
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let err = worker.run(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, SimulationError::ModelVerification(_)));
}

#[tokio::test(start_paused = true)]
async fn test_update_bus_notification_switches_model() {
    let harness = Harness::new();
    let v1 = harness
        .models
        .publish("[model_fn]\nvalue = 1\n")
        .await
        .unwrap();

    let worker = harness.worker("w-1");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    let broker = &harness.broker;
    assert!(
        TestEnv::wait_for(
            || async move { broker.queue_exists("actualizaciones_modelo.w-1") },
            Duration::from_secs(10),
        )
        .await
    );

    let v2 = harness
        .models
        .publish("[model_fn]\nvalue = 2\n")
        .await
        .unwrap();
    let bus = UpdateBus::new(Arc::new(harness.broker.clone()), "actualizaciones_modelo");
    bus.notify(&v2.version).await.unwrap();
    let signal = worker.update_signal();
    assert!(
        TestEnv::wait_for(
            || {
                let signal = signal.clone();
                async move { signal.is_raised() }
            },
            Duration::from_secs(10),
        )
        .await
    );

    // 场景仍带旧标记，通知已经足够触发重载
    harness.publish_scenarios(0, 1, Some(&v1.version)).await;
    assert!(harness.wait_for_results(1).await);
    let result = &harness.results()[0];
    assert_eq!(result.result["value"], 2.0);
    assert_eq!(result.model_version.as_deref(), Some(v2.version.as_str()));
    assert_eq!(worker.current_version(), Some(v2.version));

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_scenario_is_acked_and_reported() {
    let harness = Harness::new();
    harness
        .models
        .publish("[model_fn]\nratio = 1 / (index - 1)\n")
        .await
        .unwrap();

    let worker = harness.worker("w-1");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    // 第二个场景 index = 1，除数为零
    harness.publish_scenarios(0, 3, None).await;
    assert!(harness.wait_for_results(3).await);

    let results = harness.results();
    assert_eq!(results.iter().filter(|r| !r.success).count(), 1);
    let failed = results.iter().find(|r| !r.success).unwrap();
    assert!(failed.error_message().unwrap().contains("除数为零"));
    assert_eq!(harness.broker.queue_state("escenarios").unwrap().message_count, 0);

    shutdown_tx.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_scenario_is_dropped() {
    let harness = Harness::new();
    let model = harness.models.publish(SIMPLE_MODEL).await.unwrap();
    let worker = harness.worker("w-1");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    harness.scenarios.publish_raw(b"{\"not\": \"a scenario\"}").await.unwrap();
    harness
        .publish_scenarios(0, 1, Some(&model.version))
        .await;
    assert!(harness.wait_for_results(1).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.results().len(), 1);
    assert_eq!(harness.broker.queue_state("escenarios").unwrap().message_count, 0);

    shutdown_tx.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.processed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_stats_and_reconnect() {
    let harness = Harness::new();
    harness.models.publish(SIMPLE_MODEL).await.unwrap();
    let worker = harness.worker("w-1");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    // 默认 30 秒上报一次
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(harness.stats().len(), 1);

    // 代理重启后 Worker 重新连接并继续消费
    harness.broker.set_available(false);
    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.broker.set_available(true);
    harness.publish_scenarios(0, 2, None).await;
    assert!(harness.wait_for_results(2).await);

    shutdown_tx.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.processed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_workers_share_the_queue() {
    let harness = Harness::new();
    harness.models.publish(SIMPLE_MODEL).await.unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut tasks = Vec::new();
    for id in ["w-a", "w-b"] {
        let worker = harness.worker(id);
        let rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { worker.run(rx).await }));
    }
    let broker = &harness.broker;
    assert!(
        TestEnv::wait_for(
            || async move {
                broker
                    .queue_state("escenarios")
                    .map(|state| state.consumer_count == 2)
                    .unwrap_or(false)
            },
            Duration::from_secs(10),
        )
        .await
    );

    harness.publish_scenarios(0, 10, None).await;
    assert!(harness.wait_for_results(10).await);

    shutdown_tx.send(()).unwrap();
    let mut processed = 0;
    for task in tasks {
        processed += task.await.unwrap().unwrap().processed;
    }
    assert_eq!(processed, 10);
}

#[test]
fn test_bundled_traffic_model_evaluates() {
    let source = include_str!("../../../models/traffic.model");
    let model = ExpressionEvaluator::default().compile(source).unwrap();
    let sampler = ScenarioSampler::new().unwrap();

    for scenario in sampler.batch(0, 50, None) {
        let output = model.invoke(&scenario).unwrap();
        assert!(output["load"].as_f64().unwrap() >= 0.0);
        assert!(output["queue_length"].as_f64().unwrap() >= 0.0);
        assert!(output["congested"].is_boolean());
        assert!(output.get("_arrivals").is_none());
    }
}

fn deeply_nested_model() -> String {
    format!("[model_fn]\ny = {}1{}\n", "(".repeat(20_000), ")".repeat(20_000))
}

#[test]
fn test_deeply_nested_model_is_rejected() {
    let source = deeply_nested_model();
    let policy = EvaluatorPolicy::default();
    assert!(source.len() < policy.max_source_bytes);

    let err = ExpressionEvaluator::new(policy).compile(&source).err().unwrap();
    assert!(matches!(err, SimulationError::Compilation(_)));
    assert!(err.is_fatal_at_startup());

    let chain = format!("[model_fn]\ny = {}\n", vec!["1"; 15_000].join("+"));
    assert!(chain.len() < EvaluatorPolicy::default().max_source_bytes);
    assert!(matches!(
        ExpressionEvaluator::default().compile(&chain).err().unwrap(),
        SimulationError::Compilation(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_deeply_nested_model_keeps_prior_model() {
    let harness = Harness::new();
    let v1 = harness
        .models
        .publish("[model_fn]\nvalue = 1\n")
        .await
        .unwrap();

    let worker = harness.worker("w-1");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };
    let broker = &harness.broker;
    assert!(
        TestEnv::wait_for(
            || async move { broker.queue_exists("actualizaciones_modelo.w-1") },
            Duration::from_secs(10),
        )
        .await
    );

    let v2 = harness.models.publish(&deeply_nested_model()).await.unwrap();
    let bus = UpdateBus::new(Arc::new(harness.broker.clone()), "actualizaciones_modelo");
    bus.notify(&v2.version).await.unwrap();
    let signal = worker.update_signal();
    assert!(
        TestEnv::wait_for(
            || {
                let signal = signal.clone();
                async move { signal.is_raised() }
            },
            Duration::from_secs(10),
        )
        .await
    );

    harness.publish_scenarios(0, 1, Some(&v1.version)).await;
    assert!(harness.wait_for_results(1).await);
    let result = &harness.results()[0];
    assert!(result.success);
    assert_eq!(result.result["value"], 1.0);
    assert_eq!(worker.current_version(), Some(v1.version));

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}
