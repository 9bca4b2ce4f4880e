//! 模型更新总线
//!
//! 总线名称对应一个扇出交换机，每个订阅者绑定自己的非持久 auto-delete 队列
//! `<总线名>.<订阅者>`，所以每个 Worker 都能收到每一条通知。
//! 监听器只负责置位 [`UpdateSignal`]，读取方在处理下一个场景前检查并清除。

use futures::StreamExt;
use montecarlo_domain::{model::short_version, BusEvent};
use montecarlo_errors::SimulationResult;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerConnector, PublishOptions, QueueSpec};
use crate::link::BrokerLink;
use crate::retry::RetryPolicy;

/// 单槽位的边沿触发信号，只保留最新的版本号
#[derive(Debug, Default)]
pub struct UpdateSignal {
    pending: Mutex<Option<String>>,
}

impl UpdateSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, version: impl Into<String>) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(version.into());
    }

    /// 读取并清除信号，返回期间收到的最新版本
    pub fn check_and_clear(&self) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn is_raised(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

pub struct UpdateBus {
    link: BrokerLink,
    exchange: String,
}

impl UpdateBus {
    pub fn new(connector: Arc<dyn BrokerConnector>, exchange: impl Into<String>) -> Self {
        Self {
            link: BrokerLink::new(connector),
            exchange: exchange.into(),
        }
    }

    pub fn subscriber_queue(&self, subscriber: &str) -> String {
        format!("{}.{}", self.exchange, subscriber)
    }

    /// 广播新模型版本
    pub async fn notify(&self, new_version: &str) -> SimulationResult<()> {
        let payload = serde_json::to_vec(&BusEvent::model_updated(new_version))?;
        let result = async {
            let channel = self.link.connect().await?;
            channel.declare_fanout_exchange(&self.exchange).await?;
            channel
                .publish(&self.exchange, "", &payload, &PublishOptions::default())
                .await
        }
        .await;

        match &result {
            Ok(()) => info!(version = %short_version(new_version), "已发送模型更新通知"),
            Err(_) => self.link.reset().await,
        }
        result
    }

    pub fn listener(
        &self,
        subscriber: &str,
        signal: Arc<UpdateSignal>,
        reconnect_delay: Duration,
    ) -> UpdateListener {
        UpdateListener {
            connector: self.link.connector(),
            exchange: self.exchange.clone(),
            queue: self.subscriber_queue(subscriber),
            subscriber: subscriber.to_string(),
            signal,
            retry: RetryPolicy::fixed(reconnect_delay),
        }
    }

    pub async fn close(&self) -> SimulationResult<()> {
        self.link.close().await
    }
}

enum ListenOutcome {
    Shutdown,
    StreamEnded,
}

/// 后台监听器，断线后按固定间隔无限重连，直到收到停止信号
pub struct UpdateListener {
    connector: Arc<dyn BrokerConnector>,
    exchange: String,
    queue: String,
    subscriber: String,
    signal: Arc<UpdateSignal>,
    retry: RetryPolicy,
}

impl UpdateListener {
    pub fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut retry = self.retry.start();
        loop {
            match self.listen_once(&mut shutdown_rx).await {
                Ok(ListenOutcome::Shutdown) => break,
                Ok(ListenOutcome::StreamEnded) => {
                    warn!(queue = %self.queue, "更新总线消费流已结束，准备重连");
                }
                Err(e) => {
                    warn!(queue = %self.queue, "更新总线监听失败: {}", e);
                }
            }

            let delay = retry.next_delay().unwrap_or(Duration::from_secs(5));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        info!(queue = %self.queue, "更新总线监听器已停止");
    }

    async fn listen_once(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SimulationResult<ListenOutcome> {
        let channel = self.connector.connect().await?;
        let outcome = self.consume(channel.as_ref(), shutdown_rx).await;
        if channel.is_open() {
            if let Err(e) = channel.close().await {
                debug!("关闭更新总线通道失败: {}", e);
            }
        }
        outcome
    }

    async fn consume(
        &self,
        channel: &dyn BrokerChannel,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SimulationResult<ListenOutcome> {
        channel.declare_fanout_exchange(&self.exchange).await?;
        channel
            .declare_queue(&QueueSpec::transient(&self.queue).auto_delete())
            .await?;
        channel.bind_queue(&self.queue, &self.exchange).await?;
        let mut stream = channel.consume(&self.queue, &self.subscriber).await?;
        info!(queue = %self.queue, "开始监听模型更新");

        loop {
            tokio::select! {
                next = stream.next() => {
                    let Some(delivery) = next else {
                        return Ok(ListenOutcome::StreamEnded);
                    };
                    let delivery = delivery?;
                    match serde_json::from_slice::<BusEvent>(&delivery.data) {
                        Ok(BusEvent::ModelUpdated { new_version, .. }) => {
                            info!(version = %short_version(&new_version), "收到模型更新通知");
                            self.signal.raise(new_version);
                        }
                        Ok(other) => debug!("忽略总线事件: {:?}", other),
                        Err(e) => warn!("无法解析模型更新通知: {}", e),
                    }
                    channel.ack(delivery.delivery_tag).await?;
                }
                _ = shutdown_rx.recv() => return Ok(ListenOutcome::Shutdown),
            }
        }
    }
}
