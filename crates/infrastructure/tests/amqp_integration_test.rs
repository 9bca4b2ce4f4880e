//! 针对真实 RabbitMQ 的集成测试，需要 Docker：
//! cargo test -p montecarlo-infrastructure -- --ignored

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use montecarlo_config::ModelChannelConfig;
use montecarlo_errors::SimulationError;
use montecarlo_infrastructure::{
    AmqpConnector, BrokerConnector, BrokerLink, ModelChannel, OverflowPolicy, PublishOptions,
    QueueArguments, QueueSpec,
};
use montecarlo_testing_utils::BrokerTestContainer;

struct RabbitSetup {
    #[allow(dead_code)]
    container: BrokerTestContainer,
    connector: Arc<dyn BrokerConnector>,
}

impl RabbitSetup {
    async fn new() -> Result<Self> {
        let container = BrokerTestContainer::new().await?;
        let connector: Arc<dyn BrokerConnector> = Arc::new(AmqpConnector::new(&container.config));
        Ok(Self {
            container,
            connector,
        })
    }
}

#[tokio::test]
#[ignore]
async fn test_passive_check_then_declare() -> Result<()> {
    let setup = RabbitSetup::new().await?;
    let link = BrokerLink::new(setup.connector.clone());

    let channel = link.connect().await?;
    let err = channel.inspect_queue("escenarios").await.unwrap_err();
    assert!(matches!(err, SimulationError::QueueNotFound(_)));

    let spec = QueueSpec::durable("escenarios").with_arguments(QueueArguments {
        max_length: Some(2),
        message_ttl_ms: Some(3_600_000),
        overflow: Some(OverflowPolicy::RejectPublish),
        lazy: true,
    });
    let (channel, state) = link.ensure_queue(&spec).await?;
    assert_eq!(state.message_count, 0);

    let options = PublishOptions::persistent();
    channel.publish("", "escenarios", b"{}", &options).await?;
    channel.publish("", "escenarios", b"{}", &options).await?;
    let err = channel
        .publish("", "escenarios", b"{}", &options)
        .await
        .unwrap_err();
    assert!(matches!(err, SimulationError::PublishRejected(_)));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_redeclare_with_other_arguments_is_precondition_failed() -> Result<()> {
    let setup = RabbitSetup::new().await?;
    let channel = setup.connector.connect().await?;
    channel.declare_queue(&QueueSpec::durable("resultados")).await?;

    let other = QueueSpec::durable("resultados").with_arguments(QueueArguments {
        max_length: Some(10),
        ..Default::default()
    });
    let err = channel.declare_queue(&other).await.unwrap_err();
    assert!(matches!(err, SimulationError::PreconditionFailed(_)));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_model_slot_peek() -> Result<()> {
    let setup = RabbitSetup::new().await?;
    let models = ModelChannel::new(
        setup.connector.clone(),
        "cola_modelo",
        ModelChannelConfig::default(),
    );
    let v1 = models.publish("[model_fn]\ny = 1").await?;
    let v2 = models.publish("[model_fn]\ny = 2").await?;
    assert_ne!(v1.version, v2.version);

    let reader = ModelChannel::new(
        setup.connector.clone(),
        "cola_modelo",
        ModelChannelConfig::default(),
    );
    let first = reader.try_acquire(Duration::from_secs(10)).await?;
    let second = reader.try_acquire(Duration::from_secs(10)).await?;
    assert_eq!(first.version, v2.version);
    assert_eq!(first.source_text, second.source_text);
    Ok(())
}
