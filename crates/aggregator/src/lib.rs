//! 结果聚合：去重、滚动窗口、指标发现、空闲结束检测和看板事件

pub mod hub;
pub mod service;
pub mod store;

pub use hub::DashboardHub;
pub use service::{Aggregator, InboundStream};
pub use store::{MetricsStore, ResultOutcome, SeenIds, SlotObservation};
