//! 消息代理基础设施：代理抽象、连接管理、模型通道、更新总线与消息发布

pub mod broker;
pub mod link;
pub mod model_channel;
pub mod publisher;
pub mod queues;
pub mod retry;
pub mod update_bus;

pub use broker::{
    AmqpConnector, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, InMemoryBroker,
    OverflowPolicy, PublishOptions, QueueArguments, QueueSpec, QueueState,
};
pub use link::BrokerLink;
pub use model_channel::{ModelChannel, SlotStatus, MODEL_VERSION_HEADER};
pub use publisher::JsonPublisher;
pub use queues::{
    dashboard_queue_spec, results_publish_options, results_queue_spec, stats_queue_spec,
    work_queue_spec,
};
pub use retry::{RetryPolicy, RetryState, WaitBudget};
pub use update_bus::{UpdateBus, UpdateListener, UpdateSignal};

use montecarlo_config::AppConfig;
use std::sync::Arc;

/// 按配置创建 RabbitMQ 连接器
pub fn amqp_connector(config: &AppConfig) -> Arc<dyn BrokerConnector> {
    Arc::new(AmqpConnector::new(&config.broker))
}
