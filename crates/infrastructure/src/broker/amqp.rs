use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use montecarlo_config::BrokerConfig;
use montecarlo_errors::{SimulationError, SimulationResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BrokerConnector, Delivery, DeliveryStream, PublishOptions, QueueArguments,
    QueueSpec, QueueState,
};

/// RabbitMQ 连接器，每次 connect 建立独立的连接与通道
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    connection_timeout: Duration,
}

impl AmqpConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: with_heartbeat(&config.url, config.heartbeat_seconds),
            connection_timeout: Duration::from_secs(config.connection_timeout_seconds),
        }
    }
}

fn with_heartbeat(url: &str, heartbeat_seconds: u16) -> String {
    if url.contains("heartbeat=") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}heartbeat={heartbeat_seconds}")
}

/// 去掉URL中的用户名和密码
fn redact(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://***@{host}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

/// 按 AMQP 回复码对 lapin 错误分类
pub(crate) fn classify(context: &str, err: lapin::Error) -> SimulationError {
    classify_message(context, &err.to_string())
}

fn classify_message(context: &str, message: &str) -> SimulationError {
    if message.contains("NOT_FOUND") || message.contains("404") {
        SimulationError::QueueNotFound(format!("{context}: {message}"))
    } else if message.contains("PRECONDITION_FAILED") || message.contains("406") {
        SimulationError::PreconditionFailed(format!("{context}: {message}"))
    } else {
        SimulationError::Connection(format!("{context}: {message}"))
    }
}

fn int_value(value: u64) -> AMQPValue {
    match i32::try_from(value) {
        Ok(v) => AMQPValue::LongInt(v),
        Err(_) => AMQPValue::LongLongInt(value.min(i64::MAX as u64) as i64),
    }
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(max_length) = arguments.max_length {
        table.insert("x-max-length".into(), int_value(max_length.into()));
    }
    if let Some(ttl) = arguments.message_ttl_ms {
        table.insert("x-message-ttl".into(), int_value(ttl));
    }
    if let Some(overflow) = arguments.overflow {
        table.insert(
            "x-overflow".into(),
            AMQPValue::LongString(overflow.as_str().into()),
        );
    }
    if arguments.lazy {
        table.insert("x-queue-mode".into(), AMQPValue::LongString("lazy".into()));
    }
    table
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        data: delivery.data,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> SimulationResult<Arc<dyn BrokerChannel>> {
        let connection = tokio::time::timeout(
            self.connection_timeout,
            Connection::connect(&self.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            SimulationError::Connection(format!(
                "连接RabbitMQ超时 ({}s)",
                self.connection_timeout.as_secs()
            ))
        })?
        .map_err(|e| classify("连接RabbitMQ失败", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| classify("创建通道失败", e))?;

        // 开启发布确认，reject-publish 溢出时代理会回 basic.nack
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify("开启发布确认失败", e))?;

        debug!("成功连接到RabbitMQ: {}", redact(&self.url));
        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }

    fn describe(&self) -> String {
        redact(&self.url)
    }
}

/// 基于 lapin 的通道实现
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> SimulationResult<QueueState> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                queue_arguments(&spec.arguments),
            )
            .await
            .map_err(|e| classify(&format!("声明队列 {} 失败", spec.name), e))?;

        debug!("队列 {} 声明成功", spec.name);
        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn inspect_queue(&self, name: &str) -> SimulationResult<QueueState> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&format!("检查队列 {name} 失败"), e))?;

        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn delete_queue(&self, name: &str) -> SimulationResult<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| classify(&format!("删除队列 {name} 失败"), e))?;

        debug!("队列 {} 已删除", name);
        Ok(())
    }

    async fn declare_fanout_exchange(&self, name: &str) -> SimulationResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&format!("声明交换机 {name} 失败"), e))?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> SimulationResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&format!("绑定队列 {queue} 到 {exchange} 失败"), e))?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> SimulationResult<()> {
        let target = if exchange.is_empty() {
            routing_key
        } else {
            exchange
        };

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if options.persistent { 2 } else { 1 });
        if let Some(expiration) = options.expiration_ms {
            properties = properties.with_expiration(expiration.to_string().into());
        }
        if !options.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (key, value) in &options.headers {
                headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
            }
            properties = properties.with_headers(headers);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| classify(&format!("发布消息到 {target} 失败"), e))?;

        let confirmation = confirm
            .await
            .map_err(|e| classify(&format!("等待 {target} 发布确认失败"), e))?;

        if confirmation.is_nack() {
            return Err(SimulationError::PublishRejected(target.to_string()));
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> SimulationResult<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| classify(&format!("从队列 {queue} 获取消息失败"), e))?;

        Ok(message.map(|m| to_delivery(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64) -> SimulationResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| classify("确认消息失败", e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> SimulationResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify("拒绝消息失败", e))
    }

    async fn set_prefetch(&self, count: u16) -> SimulationResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| classify("设置预取数量失败", e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> SimulationResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&format!("创建消费者失败 ({queue})"), e))?;

        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);
        let queue = queue.to_string();
        Ok(consumer
            .map(move |result| {
                result
                    .map(to_delivery)
                    .map_err(|e| classify(&format!("消费队列 {queue} 中断"), e))
            })
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> SimulationResult<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "正常关闭").await {
                warn!("关闭通道失败: {}", e);
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "正常关闭")
                .await
                .map_err(|e| classify("关闭连接失败", e))?;
        }
        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}
