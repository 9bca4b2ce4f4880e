//! 消息代理抽象
//!
//! `BrokerChannel` 只暴露协调协议真正用到的 AMQP 语义：队列声明（含被动检查）、
//! 扇出交换机、发布确认、basic.get、ack/nack、预取和消费流。
//! 生产环境使用 [`amqp`] 中基于 lapin 的实现，测试使用 [`memory`] 中的内存代理。

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use montecarlo_errors::SimulationResult;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use amqp::AmqpConnector;
pub use memory::InMemoryBroker;

/// 队列满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    DropHead,
    RejectPublish,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::DropHead => "drop-head",
            OverflowPolicy::RejectPublish => "reject-publish",
        }
    }
}

/// 声明队列时携带的 x-* 参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub max_length: Option<u32>,
    pub message_ttl_ms: Option<u64>,
    pub overflow: Option<OverflowPolicy>,
    pub lazy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: QueueArguments::default(),
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            durable: false,
            ..Self::durable(name)
        }
    }

    pub fn with_arguments(mut self, arguments: QueueArguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub persistent: bool,
    pub expiration_ms: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Self::default()
        }
    }

    pub fn with_expiration(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

pub type DeliveryStream = BoxStream<'static, SimulationResult<Delivery>>;

/// 一个已打开的代理通道
///
/// 与 RabbitMQ 一致：对不存在的队列做被动检查、或以不同参数重复声明时，代理会关闭通道，
/// 调用方需要重新获取通道才能继续。
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 按规格声明队列，已存在且参数一致时返回当前状态
    async fn declare_queue(&self, spec: &QueueSpec) -> SimulationResult<QueueState>;

    /// 被动声明，队列不存在时返回 `QueueNotFound`
    async fn inspect_queue(&self, name: &str) -> SimulationResult<QueueState>;

    async fn delete_queue(&self, name: &str) -> SimulationResult<()>;

    async fn declare_fanout_exchange(&self, name: &str) -> SimulationResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str) -> SimulationResult<()>;

    /// 发布并等待代理确认，被拒绝时返回 `PublishRejected`
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> SimulationResult<()>;

    /// basic.get，需要手动确认
    async fn get(&self, queue: &str) -> SimulationResult<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> SimulationResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> SimulationResult<()>;

    async fn set_prefetch(&self, count: u16) -> SimulationResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> SimulationResult<DeliveryStream>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> SimulationResult<()>;
}

/// 建立新的代理通道
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> SimulationResult<Arc<dyn BrokerChannel>>;

    /// 日志中使用的目标描述
    fn describe(&self) -> String;
}
