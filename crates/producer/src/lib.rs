//! 场景生产端：自适应填充工作队列、发布和热更新模型

pub mod controller;
pub mod producer;
pub mod watcher;

pub use controller::{ProductionLimits, QueueStatus, SimulationController, SimulationStatus};
pub use producer::{plan_cycle, CyclePlan, CycleReport, ScenarioProducer};
pub use watcher::ModelFileWatcher;
