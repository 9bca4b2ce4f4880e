//! Monte Carlo Worker：模型获取与热重载、场景消费、结果和统计上报

pub mod evaluator;
pub mod service;
pub mod state;
pub mod stats;

pub use evaluator::{
    CompiledModel, EvaluatorPolicy, ExpressionEvaluator, ModelEvaluator, ModelFunction,
    SyntaxError,
};
pub use service::{LoadedModel, MonteCarloWorker, ReloadTrigger};
pub use state::WorkerState;
pub use stats::{WorkerCounters, WorkerSummary};
