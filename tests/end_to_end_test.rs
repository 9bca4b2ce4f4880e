use std::sync::Arc;
use std::time::Duration;

use montecarlo::app::{AppMode, Application};
use montecarlo_config::AppConfig;
use montecarlo_domain::ScenarioResult;
use montecarlo_infrastructure::InMemoryBroker;
use montecarlo_testing_utils::{small_config, ModelFile, TestEnv, SIMPLE_MODEL};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn spawn_app(
    broker: &InMemoryBroker,
    config: &AppConfig,
    mode: AppMode,
    shutdown_tx: &broadcast::Sender<()>,
) -> JoinHandle<anyhow::Result<()>> {
    let app = Application::with_connector(config.clone(), mode, Arc::new(broker.clone()));
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move { app.run(shutdown_rx).await })
}

fn results(broker: &InMemoryBroker) -> Vec<ScenarioResult> {
    broker
        .peek_messages("resultados")
        .iter()
        .map(|data| serde_json::from_slice(data).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_full_pipeline() {
    let broker = InMemoryBroker::new();
    let model = ModelFile::new(SIMPLE_MODEL).unwrap();
    let mut config = small_config();
    config.producer.model_file = model.path_str();
    config.worker.worker_id = "w-e2e".to_string();
    config.api.enabled = false;

    let (shutdown_tx, _) = broadcast::channel(1);
    let producer = spawn_app(&broker, &config, AppMode::Producer, &shutdown_tx);
    let worker = spawn_app(&broker, &config, AppMode::Worker, &shutdown_tx);

    // 生产端填充，Worker 消费并回报
    let broker_ref = &broker;
    assert!(
        TestEnv::wait_for(
            || async move { broker_ref.peek_messages("resultados").len() >= 20 },
            Duration::from_secs(30),
        )
        .await
    );
    let first = results(&broker);
    let first_version = first[0].model_version.clone().unwrap();
    assert!(first.iter().all(|r| r.success && r.consumer == "w-e2e"));

    // 修改模型文件，新版本经由更新总线到达 Worker
    model
        .rewrite("[model_fn]\nvalue = uniform * 3\nhigh = false\n")
        .unwrap();
    let expected = first_version.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let expected = expected.clone();
                async move {
                    results(broker_ref)
                        .iter()
                        .any(|r| r.model_version.as_deref() != Some(expected.as_str()))
                }
            },
            Duration::from_secs(30),
        )
        .await
    );

    // 聚合器接手后结果队列被清空
    let aggregator = spawn_app(&broker, &config, AppMode::Aggregator, &shutdown_tx);
    assert!(
        TestEnv::wait_for(
            || async move {
                broker_ref
                    .queue_state("resultados")
                    .map(|state| state.consumer_count == 1 && state.message_count == 0)
                    .unwrap_or(false)
            },
            Duration::from_secs(30),
        )
        .await
    );

    shutdown_tx.send(()).unwrap();
    producer.await.unwrap().unwrap();
    worker.await.unwrap().unwrap();
    aggregator.await.unwrap().unwrap();
    assert_eq!(broker.queue_state("escenarios").unwrap().consumer_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_worker_without_model_fails() {
    let broker = InMemoryBroker::new();
    let mut config = small_config();
    config.worker.worker_id = "w-lonely".to_string();

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = spawn_app(&broker, &config, AppMode::Worker, &shutdown_tx);

    let err = worker.await.unwrap().unwrap_err();
    assert!(format!("{:#}", err).contains("Worker异常退出"));
}

#[tokio::test(start_paused = true)]
async fn test_producer_fails_without_model_file() {
    let broker = InMemoryBroker::new();
    let mut config = small_config();
    config.producer.model_file = "/nonexistent/traffic.model".to_string();

    let (shutdown_tx, _) = broadcast::channel(1);
    let producer = spawn_app(&broker, &config, AppMode::Producer, &shutdown_tx);

    assert!(producer.await.unwrap().is_err());
    assert!(!broker.queue_exists("cola_modelo"));
}
