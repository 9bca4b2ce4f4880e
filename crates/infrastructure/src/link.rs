//! 代理连接管理
//!
//! BrokerLink 缓存一个打开的通道，并实现"先被动检查、不存在再创建"的声明方式。
//! 它自身不做任何重试，传输错误原样交给调用方。

use montecarlo_errors::{SimulationError, SimulationResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerConnector, QueueSpec, QueueState};

pub struct BrokerLink {
    connector: Arc<dyn BrokerConnector>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl BrokerLink {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            channel: Mutex::new(None),
        }
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        self.connector.clone()
    }

    /// 返回缓存的通道，已关闭时重新建立
    pub async fn connect(&self) -> SimulationResult<Arc<dyn BrokerChannel>> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }
        let channel = self.connector.connect().await?;
        debug!("已建立到 {} 的通道", self.connector.describe());
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// 丢弃当前通道并建立新的通道
    pub async fn reconnect(&self) -> SimulationResult<Arc<dyn BrokerChannel>> {
        self.reset().await;
        self.connect().await
    }

    /// 被动检查队列，不存在时换一个新通道按规格声明
    pub async fn ensure_queue(
        &self,
        spec: &QueueSpec,
    ) -> SimulationResult<(Arc<dyn BrokerChannel>, QueueState)> {
        let channel = self.connect().await?;
        match channel.inspect_queue(&spec.name).await {
            Ok(state) => Ok((channel, state)),
            Err(SimulationError::QueueNotFound(_)) => {
                // 被动检查失败后代理已关闭该通道
                debug!("队列 {} 不存在，重新连接后声明", spec.name);
                let channel = self.reconnect().await?;
                let state = channel.declare_queue(spec).await?;
                info!(queue = %spec.name, durable = spec.durable, "队列已创建");
                Ok((channel, state))
            }
            Err(e) => {
                self.reset().await;
                Err(e)
            }
        }
    }

    /// 关闭并丢弃当前通道，错误只记录日志
    pub async fn reset(&self) {
        let previous = self.channel.lock().await.take();
        if let Some(channel) = previous {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    warn!("关闭通道失败: {}", e);
                }
            }
        }
    }

    pub async fn close(&self) -> SimulationResult<()> {
        let previous = self.channel.lock().await.take();
        match previous {
            Some(channel) if channel.is_open() => channel.close().await,
            _ => Ok(()),
        }
    }
}
