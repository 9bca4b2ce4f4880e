//! 蒙特卡洛模拟的领域模型
//!
//! 所有跨进程传递的消息体都定义在这里，字段名即线上协议（camelCase JSON）。

pub mod events;
pub mod model;
pub mod sampler;
pub mod scenario;
pub mod snapshot;

pub use events::{BusEvent, DashboardEvent, ModelChangedEvent, SimulationFinishedEvent};
pub use model::{ModelState, ModelVersion};
pub use montecarlo_errors::{SimulationError, SimulationResult};
pub use sampler::{ScenarioSampler, DISTRIBUTION_NAMES};
pub use scenario::{Scenario, ScenarioMetadata, ScenarioResult, WorkerStats};
pub use snapshot::{AggregateSnapshot, MetricKind, MetricSummary, ModelInfo, WorkerPerformance};
