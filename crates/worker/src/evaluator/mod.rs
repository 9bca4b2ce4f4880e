//! 模型求值能力
//!
//! Worker 只依赖 [`ModelEvaluator`]：给定模型源码，返回可调用的 [`ModelFunction`]。
//! 默认实现 [`ExpressionEvaluator`] 解释一种只做数值计算的声明式语言，没有任何 I/O；
//! 源码大小、语句数量、嵌套深度和入口段名称由 [`EvaluatorPolicy`] 限定。

mod program;
mod syntax;

use montecarlo_config::EvaluatorConfig;
use montecarlo_domain::Scenario;
use montecarlo_errors::SimulationResult;
use serde_json::{Map, Value};
use std::sync::Arc;

pub use program::CompiledModel;
pub use syntax::SyntaxError;

/// 已编译的模型入口
pub trait ModelFunction: Send + Sync {
    fn invoke(&self, scenario: &Scenario) -> SimulationResult<Map<String, Value>>;
}

/// 把模型源码编译为可调用对象，找不到入口时返回 `Compilation` 错误
#[cfg_attr(test, mockall::automock)]
pub trait ModelEvaluator: Send + Sync {
    fn compile(&self, source: &str) -> SimulationResult<Arc<dyn ModelFunction>>;

    /// 日志中显示的求值器名称
    fn name(&self) -> &'static str;
}

/// 求值沙箱策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorPolicy {
    pub entry_point: String,
    pub max_source_bytes: usize,
    pub max_statements: usize,
    pub max_depth: usize,
}

impl Default for EvaluatorPolicy {
    fn default() -> Self {
        Self::from(&EvaluatorConfig::default())
    }
}

impl From<&EvaluatorConfig> for EvaluatorPolicy {
    fn from(config: &EvaluatorConfig) -> Self {
        Self {
            entry_point: config.entry_point.clone(),
            max_source_bytes: config.max_source_bytes,
            max_statements: config.max_statements,
            max_depth: config.max_depth,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator {
    policy: EvaluatorPolicy,
}

impl ExpressionEvaluator {
    pub fn new(policy: EvaluatorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EvaluatorPolicy {
        &self.policy
    }
}

impl ModelEvaluator for ExpressionEvaluator {
    fn compile(&self, source: &str) -> SimulationResult<Arc<dyn ModelFunction>> {
        let model = CompiledModel::compile(source, &self.policy)?;
        Ok(Arc::new(model))
    }

    fn name(&self) -> &'static str {
        "expression"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use montecarlo_domain::ScenarioSampler;

    #[test]
    fn test_expression_evaluator_compiles_sampled_scenario() {
        let evaluator = ExpressionEvaluator::default();
        let model = evaluator
            .compile("[model_fn]\ntotal = uniform + uniform_range + beta\n")
            .unwrap();
        let scenario = ScenarioSampler::new().unwrap().batch(0, 1, None).remove(0);
        let output = model.invoke(&scenario).unwrap();
        assert!(output["total"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn test_policy_from_config() {
        let config = EvaluatorConfig {
            entry_point: "run".to_string(),
            max_source_bytes: 10,
            max_statements: 1,
            max_depth: 8,
        };
        let policy = EvaluatorPolicy::from(&config);
        assert_eq!(policy.entry_point, "run");
        assert_eq!(policy.max_source_bytes, 10);
        assert_eq!(policy.max_statements, 1);
        assert_eq!(policy.max_depth, 8);
    }
}
