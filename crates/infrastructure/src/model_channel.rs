//! 模型分发通道
//!
//! 当前模型放在一个容量为1、带 TTL 的非持久队列里。发布新版本前先删除旧队列，
//! 读取方通过 basic.get + nack(requeue) 窥视消息，从不真正消费，
//! 因此任意多个 Worker 都能拿到同一份模型。

use montecarlo_config::ModelChannelConfig;
use montecarlo_domain::{model::short_version, ModelVersion};
use montecarlo_errors::{SimulationError, SimulationResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, PublishOptions, QueueArguments, QueueSpec, QueueState};
use crate::link::BrokerLink;
use crate::retry::WaitBudget;

pub const MODEL_VERSION_HEADER: &str = "model-version";

/// 模型槽位的观测结果
#[derive(Debug, Clone, PartialEq)]
pub enum SlotStatus {
    Missing,
    Present {
        message_count: u32,
        model: Option<ModelVersion>,
    },
}

pub struct ModelChannel {
    link: BrokerLink,
    queue: String,
    config: ModelChannelConfig,
    current: Mutex<Option<ModelVersion>>,
}

impl ModelChannel {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        queue: impl Into<String>,
        config: ModelChannelConfig,
    ) -> Self {
        Self {
            link: BrokerLink::new(connector),
            queue: queue.into(),
            config,
            current: Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.config.ttl_ms)
    }

    fn slot_spec(&self) -> QueueSpec {
        QueueSpec::transient(&self.queue).with_arguments(QueueArguments {
            max_length: Some(1),
            message_ttl_ms: Some(self.config.ttl_ms),
            ..Default::default()
        })
    }

    /// 最近一次由本实例发布的模型
    pub fn current(&self) -> Option<ModelVersion> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 发布新模型并返回新版本，旧槽位先被删除
    pub async fn publish(&self, source_text: &str) -> SimulationResult<ModelVersion> {
        let model = ModelVersion::new(source_text).activate();
        let payload = serde_json::to_vec(&model)?;

        let result = self.replace_slot(&model, &payload).await;
        if result.is_err() {
            self.link.reset().await;
        }
        result?;

        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(model.clone());
        if let Some(mut previous) = previous {
            previous.invalidate();
            debug!(version = %previous.short_id(), "旧模型版本已失效");
        }

        info!(
            version = %model.short_id(),
            queue = %self.queue,
            "新模型已发布"
        );
        Ok(model)
    }

    async fn replace_slot(&self, model: &ModelVersion, payload: &[u8]) -> SimulationResult<()> {
        let channel = self.link.connect().await?;
        // 队列不存在等错误可以忽略
        if let Err(e) = channel.delete_queue(&self.queue).await {
            debug!("删除旧模型队列失败（忽略）: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(self.config.invalidation_grace_ms)).await;

        let channel = self.link.connect().await?;
        channel.declare_queue(&self.slot_spec()).await?;
        let options = PublishOptions::default()
            .with_expiration(self.config.ttl_ms)
            .with_header(MODEL_VERSION_HEADER, model.version.as_str());
        channel.publish("", &self.queue, payload, &options).await
    }

    /// 在等待预算内轮询模型槽位，期间的传输错误全部吞掉
    pub async fn try_acquire(&self, max_wait: Duration) -> SimulationResult<ModelVersion> {
        let budget = WaitBudget::new(max_wait);
        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);
        let retry_after_error = Duration::from_secs(self.config.retry_after_error_seconds);

        loop {
            let delay = match self.peek().await {
                Ok(Some(model)) => {
                    debug!(
                        version = %model.short_id(),
                        waited_ms = budget.elapsed().as_millis() as u64,
                        "已获取模型"
                    );
                    return Ok(model);
                }
                Ok(None) => poll_interval,
                Err(e) => {
                    debug!("轮询模型槽位失败: {}", e);
                    self.link.reset().await;
                    retry_after_error
                }
            };

            if budget.is_exhausted() {
                return Err(SimulationError::AcquisitionTimeout {
                    waited_secs: budget.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(delay.min(budget.remaining())).await;
        }
    }

    /// 窥视当前模型，槽位不存在或为空时返回 None
    pub async fn peek(&self) -> SimulationResult<Option<ModelVersion>> {
        match self.read_slot().await? {
            SlotStatus::Present { model, .. } => Ok(model),
            SlotStatus::Missing => Ok(None),
        }
    }

    /// 检查槽位状态，同时窥视其中的模型
    pub async fn slot_status(&self) -> SimulationResult<SlotStatus> {
        let result = self.read_slot().await;
        if result.is_err() {
            self.link.reset().await;
        }
        result
    }

    async fn read_slot(&self) -> SimulationResult<SlotStatus> {
        let channel = self.link.connect().await?;
        let state: QueueState = match channel.inspect_queue(&self.queue).await {
            Ok(state) => state,
            // 发布新模型的间隙中队列可能暂时不存在
            Err(SimulationError::QueueNotFound(_)) => return Ok(SlotStatus::Missing),
            Err(e) => return Err(e),
        };

        let delivery = match channel.get(&self.queue).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                return Ok(SlotStatus::Present {
                    message_count: state.message_count,
                    model: None,
                })
            }
            Err(SimulationError::QueueNotFound(_)) => return Ok(SlotStatus::Missing),
            Err(e) => return Err(e),
        };
        // 放回队列，保证其他读取方也能拿到
        channel.nack(delivery.delivery_tag, true).await?;

        let model = match serde_json::from_slice::<ModelVersion>(&delivery.data) {
            Ok(model) if model.is_active() => Some(model),
            Ok(model) => {
                debug!(version = %short_version(&model.version), "跳过非活动状态的模型");
                None
            }
            Err(e) => {
                warn!(queue = %self.queue, "模型消息格式错误: {}", e);
                None
            }
        };
        Ok(SlotStatus::Present {
            message_count: state.message_count.max(1),
            model,
        })
    }

    pub async fn close(&self) -> SimulationResult<()> {
        self.link.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerChannel, InMemoryBroker};

    fn config() -> ModelChannelConfig {
        ModelChannelConfig::default()
    }

    fn channel(broker: &InMemoryBroker) -> ModelChannel {
        ModelChannel::new(Arc::new(broker.clone()), "cola_modelo", config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_leaves_single_message() {
        let broker = InMemoryBroker::new();
        let models = channel(&broker);

        let v1 = models.publish("[model_fn]\ny = 1").await.unwrap();
        let v2 = models.publish("[model_fn]\ny = 2").await.unwrap();
        assert_ne!(v1.version, v2.version);
        assert_eq!(broker.queue_state("cola_modelo").unwrap().message_count, 1);

        let stored: ModelVersion =
            serde_json::from_slice(&broker.peek_messages("cola_modelo")[0]).unwrap();
        assert_eq!(stored.version, v2.version);
        assert_eq!(models.current().unwrap().version, v2.version);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_a_peek() {
        let broker = InMemoryBroker::new();
        let publisher = channel(&broker);
        let published = publisher.publish("[model_fn]\ny = 3").await.unwrap();

        let reader_a = channel(&broker);
        let reader_b = channel(&broker);
        let a = reader_a.try_acquire(Duration::from_secs(5)).await.unwrap();
        let b = reader_b.try_acquire(Duration::from_secs(5)).await.unwrap();
        assert_eq!(a.source_text, "[model_fn]\ny = 3");
        assert_eq!(a.source_text, b.source_text);
        assert_eq!(a.version, published.version);
        assert_eq!(broker.queue_state("cola_modelo").unwrap().message_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_returns_latest_source() {
        let broker = InMemoryBroker::new();
        let publisher = channel(&broker);
        publisher.publish("[model_fn]\ny = 1").await.unwrap();
        publisher.publish("[model_fn]\ny = 42").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reader = channel(&broker);
            handles.push(tokio::spawn(async move {
                reader.try_acquire(Duration::from_secs(30)).await
            }));
        }
        for handle in handles {
            let model = handle.await.unwrap().unwrap();
            assert_eq!(model.source_text, "[model_fn]\ny = 42");
        }
        assert_eq!(broker.queue_state("cola_modelo").unwrap().message_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_without_model() {
        let broker = InMemoryBroker::new();
        let reader = channel(&broker);
        let started = tokio::time::Instant::now();
        let err = reader.try_acquire(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(
            err,
            SimulationError::AcquisitionTimeout { waited_secs: 10 }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_survives_broker_outage() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let reader = channel(&broker);

        let publisher_broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            publisher_broker.set_available(true);
            let publisher = channel(&publisher_broker);
            publisher.publish("[model_fn]\ny = 5").await.unwrap();
        });

        let model = reader.try_acquire(Duration::from_secs(30)).await.unwrap();
        assert_eq!(model.source_text, "[model_fn]\ny = 5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_expires_after_ttl() {
        let broker = InMemoryBroker::new();
        let models = ModelChannel::new(
            Arc::new(broker.clone()),
            "cola_modelo",
            ModelChannelConfig {
                ttl_ms: 1000,
                ..config()
            },
        );
        models.publish("[model_fn]\ny = 1").await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(models.peek().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_status() {
        let broker = InMemoryBroker::new();
        let models = channel(&broker);
        assert_eq!(models.slot_status().await.unwrap(), SlotStatus::Missing);

        let published = models.publish("[model_fn]\ny = 1").await.unwrap();
        match models.slot_status().await.unwrap() {
            SlotStatus::Present {
                message_count,
                model,
            } => {
                assert_eq!(message_count, 1);
                assert_eq!(model.unwrap().version, published.version);
            }
            SlotStatus::Missing => panic!("slot should be present"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_slot_message_is_skipped() {
        let broker = InMemoryBroker::new();
        let raw = broker.connect().await.unwrap();
        let models = channel(&broker);
        raw.declare_queue(&models.slot_spec()).await.unwrap();
        raw.publish("", "cola_modelo", b"not json", &PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(models.peek().await.unwrap(), None);
        assert_eq!(broker.queue_state("cola_modelo").unwrap().message_count, 1);
    }
}
