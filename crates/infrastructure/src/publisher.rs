//! JSON 消息发布
//!
//! 结果、统计和看板事件都通过 JsonPublisher 发送：首次发布前确保队列存在，
//! 传输失败时丢弃通道，下次发布重新建立。

use montecarlo_errors::{SimulationError, SimulationResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::broker::{BrokerConnector, PublishOptions, QueueSpec, QueueState};
use crate::link::BrokerLink;

pub struct JsonPublisher {
    link: BrokerLink,
    spec: QueueSpec,
    options: PublishOptions,
    declared: AtomicBool,
}

impl JsonPublisher {
    pub fn new(connector: Arc<dyn BrokerConnector>, spec: QueueSpec, options: PublishOptions) -> Self {
        Self {
            link: BrokerLink::new(connector),
            spec,
            options,
            declared: AtomicBool::new(false),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.spec.name
    }

    /// 确保队列存在并返回其状态
    pub async fn ensure_queue(&self) -> SimulationResult<QueueState> {
        match self.link.ensure_queue(&self.spec).await {
            Ok((_, state)) => {
                self.declared.store(true, Ordering::SeqCst);
                Ok(state)
            }
            Err(e) => {
                self.declared.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub async fn publish<T: Serialize>(&self, message: &T) -> SimulationResult<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish_raw(&payload).await
    }

    pub async fn publish_raw(&self, payload: &[u8]) -> SimulationResult<()> {
        if !self.declared.load(Ordering::SeqCst) {
            self.ensure_queue().await?;
        }
        let channel = self.link.connect().await?;
        match channel
            .publish("", &self.spec.name, payload, &self.options)
            .await
        {
            Ok(()) => Ok(()),
            // 队列已满不是传输错误，通道仍然可用
            Err(e @ SimulationError::PublishRejected(_)) => Err(e),
            Err(e) => {
                self.declared.store(false, Ordering::SeqCst);
                self.link.reset().await;
                Err(e)
            }
        }
    }

    /// 尽力发布，失败只记录日志
    pub async fn publish_best_effort<T: Serialize>(&self, message: &T) -> bool {
        match self.publish(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(queue = %self.spec.name, "消息发布失败，已丢弃: {}", e);
                false
            }
        }
    }

    pub async fn close(&self) -> SimulationResult<()> {
        self.link.close().await
    }
}
