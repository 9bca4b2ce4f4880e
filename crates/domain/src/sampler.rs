//! 场景负载的随机抽样
//!
//! 每个场景包含十个具名的分布样本，生产者和 Worker 的冒烟调用共用同一套分布。

use chrono::Utc;
use rand::Rng;
use rand_distr::{Beta, Binomial, Distribution, Exp, Gamma, Normal, Poisson, StandardNormal};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::scenario::{Scenario, ScenarioMetadata};
use montecarlo_errors::{SimulationError, SimulationResult};

pub const DISTRIBUTION_NAMES: [&str; 10] = [
    "uniform",
    "uniform_range",
    "standard_normal",
    "custom_normal",
    "binomial",
    "poisson",
    "bernoulli",
    "exponential",
    "gamma",
    "beta",
];

#[derive(Debug, Clone)]
pub struct ScenarioSampler {
    custom_normal: Normal<f64>,
    binomial: Binomial,
    poisson: Poisson<f64>,
    bernoulli: Binomial,
    exponential: Exp<f64>,
    gamma: Gamma<f64>,
    beta: Beta<f64>,
}

fn invalid(name: &str, err: impl std::fmt::Display) -> SimulationError {
    SimulationError::Internal(format!("分布参数无效 {name}: {err}"))
}

impl ScenarioSampler {
    pub fn new() -> SimulationResult<Self> {
        Ok(Self {
            custom_normal: Normal::new(50.0, 15.0).map_err(|e| invalid("custom_normal", e))?,
            binomial: Binomial::new(100, 0.5).map_err(|e| invalid("binomial", e))?,
            poisson: Poisson::new(10.0).map_err(|e| invalid("poisson", e))?,
            bernoulli: Binomial::new(1, 0.3).map_err(|e| invalid("bernoulli", e))?,
            // scale 2 => lambda 0.5
            exponential: Exp::new(0.5).map_err(|e| invalid("exponential", e))?,
            gamma: Gamma::new(2.0, 2.0).map_err(|e| invalid("gamma", e))?,
            beta: Beta::new(2.0, 5.0).map_err(|e| invalid("beta", e))?,
        })
    }

    /// 抽取一组样本
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Map<String, Value> {
        let standard_normal: f64 = StandardNormal.sample(rng);
        let mut payload = Map::new();
        payload.insert("uniform".into(), json!(rng.random::<f64>()));
        payload.insert("uniform_range".into(), json!(rng.random_range(0.0..100.0)));
        payload.insert("standard_normal".into(), json!(standard_normal));
        payload.insert("custom_normal".into(), json!(self.custom_normal.sample(rng)));
        payload.insert("binomial".into(), json!(self.binomial.sample(rng)));
        payload.insert("poisson".into(), json!(self.poisson.sample(rng) as u64));
        payload.insert("bernoulli".into(), json!(self.bernoulli.sample(rng)));
        payload.insert("exponential".into(), json!(self.exponential.sample(rng)));
        payload.insert("gamma".into(), json!(self.gamma.sample(rng)));
        payload.insert("beta".into(), json!(self.beta.sample(rng)));
        payload
    }

    pub fn scenario<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        index: u64,
        model_version: Option<&str>,
    ) -> Scenario {
        let now = Utc::now();
        Scenario {
            id: Uuid::new_v4(),
            index,
            created_at: now,
            model_version: model_version.map(str::to_string),
            payload: self.sample(rng),
            metadata: ScenarioMetadata {
                batch_timestamp: now,
                distribution_types: DISTRIBUTION_NAMES.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    /// 生成一批连续编号的场景，调用方不要在持有结果前跨越 await
    pub fn batch(&self, start_index: u64, count: usize, model_version: Option<&str>) -> Vec<Scenario> {
        let mut rng = rand::rng();
        let batch_timestamp = Utc::now();
        (0..count as u64)
            .map(|offset| {
                let mut scenario = self.scenario(&mut rng, start_index + offset, model_version);
                scenario.metadata.batch_timestamp = batch_timestamp;
                scenario
            })
            .collect()
    }
}
