use montecarlo_domain::DashboardEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// 看板事件的扇出点，没有观察者时事件直接丢弃
#[derive(Debug, Clone)]
pub struct DashboardHub {
    sender: broadcast::Sender<DashboardEvent>,
}

impl DashboardHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: DashboardEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            trace!("没有看板观察者，丢弃事件 {}", name);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
