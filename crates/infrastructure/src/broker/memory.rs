//! 内存消息代理
//!
//! 复现协调协议依赖的 RabbitMQ 行为，用于单元测试和端到端测试：
//! 被动声明不存在的队列或参数不一致的重复声明会关闭通道；x-max-length 配合
//! reject-publish；消息 TTL；nack 重新入队；预取；通道关闭时未确认消息重新入队；
//! 扇出交换机和 auto-delete 队列。

use async_trait::async_trait;
use futures::StreamExt;
use montecarlo_errors::{SimulationError, SimulationResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnector, Delivery, DeliveryStream, OverflowPolicy, PublishOptions,
    QueueSpec, QueueState,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: u32,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            consumers: 0,
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        self.ready
            .retain(|message| message.expires_at.map_or(true, |at| at > now));
    }

    fn state(&self) -> QueueState {
        QueueState {
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelRecord {
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

impl ChannelRecord {
    fn register(&mut self, queue: &str, message: StoredMessage) -> u64 {
        self.next_tag += 1;
        self.unacked
            .insert(self.next_tag, (queue.to_string(), message));
        self.next_tag
    }
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, BTreeSet<String>>,
    channels: HashMap<u64, ChannelRecord>,
    next_channel_id: u64,
}

impl BrokerState {
    fn close_channel(&mut self, id: u64) {
        if let Some(record) = self.channels.remove(&id) {
            for (_, (queue, mut message)) in record.unacked.into_iter().rev() {
                if let Some(queue) = self.queues.get_mut(&queue) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            debug!("内存通道 {} 已关闭", id);
        }
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for bound in self.exchanges.values_mut() {
            bound.remove(name);
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    wake: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> SimulationResult<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| SimulationError::Internal("内存代理状态锁已损坏".to_string()))
    }

    fn notify(&self) {
        self.wake.send_modify(|generation| *generation += 1);
    }
}

fn queue_not_found(name: &str) -> SimulationError {
    SimulationError::QueueNotFound(format!("NOT_FOUND - no queue '{name}'"))
}

fn channel_closed() -> SimulationError {
    SimulationError::Connection("通道已关闭".to_string())
}

/// 进程内的消息代理
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    available: true,
                    queues: HashMap::new(),
                    exchanges: HashMap::new(),
                    channels: HashMap::new(),
                    next_channel_id: 0,
                }),
                wake,
            }),
        }
    }

    /// 模拟代理宕机或恢复，宕机时关闭所有已打开的通道
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.shared.lock() {
            state.available = available;
            if !available {
                let ids: Vec<u64> = state.channels.keys().copied().collect();
                for id in ids {
                    state.close_channel(id);
                }
            }
        }
        self.shared.notify();
    }

    /// 不经过通道直接查看队列状态
    pub fn queue_state(&self, name: &str) -> Option<QueueState> {
        let mut state = self.shared.lock().ok()?;
        let queue = state.queues.get_mut(name)?;
        queue.purge_expired(Instant::now());
        Some(queue.state())
    }

    /// 队列声明时使用的规格
    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        let state = self.shared.lock().ok()?;
        state.queues.get(name).map(|queue| queue.spec.clone())
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared
            .lock()
            .map(|state| state.queues.contains_key(name))
            .unwrap_or(false)
    }

    /// 队列中就绪消息的内容（不含未确认消息）
    pub fn peek_messages(&self, name: &str) -> Vec<Vec<u8>> {
        let Ok(mut state) = self.shared.lock() else {
            return Vec::new();
        };
        match state.queues.get_mut(name) {
            Some(queue) => {
                queue.purge_expired(Instant::now());
                queue.ready.iter().map(|m| m.data.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn open_channels(&self) -> usize {
        self.shared
            .lock()
            .map(|state| state.channels.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> SimulationResult<Arc<dyn BrokerChannel>> {
        let id = {
            let mut state = self.shared.lock()?;
            if !state.available {
                return Err(SimulationError::Connection(
                    "连接内存代理失败: connection refused".to_string(),
                ));
            }
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.channels.insert(id, ChannelRecord::default());
            id
        };
        Ok(Arc::new(MemoryChannel {
            id,
            shared: self.shared.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

pub struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryChannel {
    /// 在通道打开的前提下执行操作；队列不存在和参数不一致属于通道级错误，会关闭通道
    fn with_open<T>(
        &self,
        op: impl FnOnce(&mut BrokerState, u64) -> SimulationResult<T>,
    ) -> SimulationResult<T> {
        let result = {
            let mut state = self.shared.lock()?;
            if !state.channels.contains_key(&self.id) {
                return Err(channel_closed());
            }
            let result = op(&mut state, self.id);
            if matches!(
                result,
                Err(SimulationError::QueueNotFound(_)) | Err(SimulationError::PreconditionFailed(_))
            ) {
                state.close_channel(self.id);
            }
            result
        };
        self.shared.notify();
        result
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            state.close_channel(self.id);
        }
        self.shared.notify();
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> SimulationResult<QueueState> {
        self.with_open(|state, _| match state.queues.get_mut(&spec.name) {
            Some(queue) => {
                if queue.spec.durable != spec.durable
                    || queue.spec.auto_delete != spec.auto_delete
                    || queue.spec.arguments != spec.arguments
                {
                    return Err(SimulationError::PreconditionFailed(format!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                        spec.name
                    )));
                }
                queue.purge_expired(Instant::now());
                Ok(queue.state())
            }
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), MemoryQueue::new(spec.clone()));
                Ok(QueueState::default())
            }
        })
    }

    async fn inspect_queue(&self, name: &str) -> SimulationResult<QueueState> {
        self.with_open(|state, _| {
            let queue = state
                .queues
                .get_mut(name)
                .ok_or_else(|| queue_not_found(name))?;
            queue.purge_expired(Instant::now());
            Ok(queue.state())
        })
    }

    async fn delete_queue(&self, name: &str) -> SimulationResult<()> {
        self.with_open(|state, _| {
            state.remove_queue(name);
            Ok(())
        })
    }

    async fn declare_fanout_exchange(&self, name: &str) -> SimulationResult<()> {
        self.with_open(|state, _| {
            state.exchanges.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> SimulationResult<()> {
        self.with_open(|state, _| {
            if !state.queues.contains_key(queue) {
                return Err(queue_not_found(queue));
            }
            let bound = state.exchanges.get_mut(exchange).ok_or_else(|| {
                SimulationError::QueueNotFound(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?;
            bound.insert(queue.to_string());
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> SimulationResult<()> {
        self.with_open(|state, _| {
            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_string()]
            } else {
                state
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| {
                        SimulationError::QueueNotFound(format!(
                            "NOT_FOUND - no exchange '{exchange}'"
                        ))
                    })?
                    .iter()
                    .cloned()
                    .collect()
            };

            let now = Instant::now();
            let mut rejected = false;
            for name in targets {
                // 无法路由的消息直接丢弃
                let Some(queue) = state.queues.get_mut(&name) else {
                    continue;
                };
                queue.purge_expired(now);

                let ttl = match (options.expiration_ms, queue.spec.arguments.message_ttl_ms) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                let message = StoredMessage {
                    data: payload.to_vec(),
                    expires_at: ttl.map(|ms| now + Duration::from_millis(ms)),
                    redelivered: false,
                };

                if let Some(max_length) = queue.spec.arguments.max_length {
                    if queue.ready.len() >= max_length as usize {
                        match queue.spec.arguments.overflow.unwrap_or_default() {
                            OverflowPolicy::RejectPublish => {
                                rejected = true;
                                continue;
                            }
                            OverflowPolicy::DropHead => {
                                queue.ready.pop_front();
                            }
                        }
                    }
                }
                queue.ready.push_back(message);
            }

            if rejected {
                let target = if exchange.is_empty() {
                    routing_key
                } else {
                    exchange
                };
                return Err(SimulationError::PublishRejected(target.to_string()));
            }
            Ok(())
        })
    }

    async fn get(&self, queue_name: &str) -> SimulationResult<Option<Delivery>> {
        self.with_open(|state, id| {
            let queue = state
                .queues
                .get_mut(queue_name)
                .ok_or_else(|| queue_not_found(queue_name))?;
            queue.purge_expired(Instant::now());
            let Some(message) = queue.ready.pop_front() else {
                return Ok(None);
            };
            let record = state.channels.get_mut(&id).ok_or_else(channel_closed)?;
            let delivery_tag = record.register(queue_name, message.clone());
            Ok(Some(Delivery {
                delivery_tag,
                data: message.data,
                redelivered: message.redelivered,
            }))
        })
    }

    async fn ack(&self, delivery_tag: u64) -> SimulationResult<()> {
        self.with_open(|state, id| {
            let record = state.channels.get_mut(&id).ok_or_else(channel_closed)?;
            match record.unacked.remove(&delivery_tag) {
                Some(_) => Ok(()),
                None => Err(SimulationError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                ))),
            }
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> SimulationResult<()> {
        self.with_open(|state, id| {
            let record = state.channels.get_mut(&id).ok_or_else(channel_closed)?;
            let Some((queue, mut message)) = record.unacked.remove(&delivery_tag) else {
                return Err(SimulationError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )));
            };
            if requeue {
                if let Some(queue) = state.queues.get_mut(&queue) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> SimulationResult<()> {
        self.with_open(|state, id| {
            let record = state.channels.get_mut(&id).ok_or_else(channel_closed)?;
            record.prefetch = count;
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> SimulationResult<DeliveryStream> {
        self.with_open(|state, _| {
            let queue = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| queue_not_found(queue))?;
            queue.consumers += 1;
            Ok(())
        })?;
        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);

        let consumer = MemoryConsumer {
            shared: self.shared.clone(),
            channel_id: self.id,
            queue: queue.to_string(),
            wake: self.shared.wake.subscribe(),
            finished: false,
        };

        Ok(futures::stream::unfold(consumer, |mut consumer| async move {
            if consumer.finished {
                return None;
            }
            loop {
                consumer.wake.borrow_and_update();
                match consumer.try_next() {
                    Some(Ok(delivery)) => return Some((Ok(delivery), consumer)),
                    Some(Err(e)) => {
                        consumer.finished = true;
                        return Some((Err(e), consumer));
                    }
                    None => {
                        if consumer.wake.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        self.shared
            .lock()
            .map(|state| state.channels.contains_key(&self.id))
            .unwrap_or(false)
    }

    async fn close(&self) -> SimulationResult<()> {
        {
            let mut state = self.shared.lock()?;
            state.close_channel(self.id);
        }
        self.shared.notify();
        Ok(())
    }
}

/// 消费流的状态，销毁时减少队列的消费者计数
struct MemoryConsumer {
    shared: Arc<Shared>,
    channel_id: u64,
    queue: String,
    wake: watch::Receiver<u64>,
    finished: bool,
}

impl MemoryConsumer {
    /// 返回 None 表示需要等待状态变化
    fn try_next(&self) -> Option<SimulationResult<Delivery>> {
        let mut state = match self.shared.lock() {
            Ok(state) => state,
            Err(e) => return Some(Err(e)),
        };
        let Some(record) = state.channels.get(&self.channel_id) else {
            return Some(Err(channel_closed()));
        };
        if record.prefetch > 0 && record.unacked.len() >= record.prefetch as usize {
            return None;
        }
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Some(Err(queue_not_found(&self.queue)));
        };
        queue.purge_expired(Instant::now());
        let message = queue.ready.pop_front()?;
        let record = state.channels.get_mut(&self.channel_id)?;
        let delivery_tag = record.register(&self.queue, message.clone());
        Some(Ok(Delivery {
            delivery_tag,
            data: message.data,
            redelivered: message.redelivered,
        }))
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            let remove = match state.queues.get_mut(&self.queue) {
                Some(queue) => {
                    queue.consumers = queue.consumers.saturating_sub(1);
                    queue.consumers == 0 && queue.spec.auto_delete
                }
                None => false,
            };
            if remove {
                state.remove_queue(&self.queue);
                debug!("auto-delete 队列 {} 已删除", self.queue);
            }
        }
        self.shared.notify();
    }
}
