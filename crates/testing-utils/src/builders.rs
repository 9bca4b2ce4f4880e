//! Test data builders
//!
//! Builders start from sensible defaults so a test only spells out the fields it cares about.

use chrono::Utc;
use montecarlo_domain::{Scenario, ScenarioMetadata, ScenarioResult, WorkerStats, DISTRIBUTION_NAMES};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Builder for Scenario messages
pub struct ScenarioBuilder {
    scenario: Scenario,
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        let mut payload = Map::new();
        payload.insert("uniform".to_string(), json!(0.5));
        payload.insert("custom_normal".to_string(), json!(50.0));
        payload.insert("poisson".to_string(), json!(10));
        Self {
            scenario: Scenario {
                id: Uuid::new_v4(),
                index: 0,
                created_at: now,
                model_version: None,
                payload,
                metadata: ScenarioMetadata {
                    batch_timestamp: now,
                    distribution_types: DISTRIBUTION_NAMES.iter().map(|s| s.to_string()).collect(),
                },
            },
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.scenario.index = index;
        self
    }

    pub fn with_model_version(mut self, version: &str) -> Self {
        self.scenario.model_version = Some(version.to_string());
        self
    }

    pub fn build(self) -> Scenario {
        self.scenario
    }
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for ScenarioResult messages
pub struct ResultBuilder {
    result: ScenarioResult,
}

impl ResultBuilder {
    pub fn new() -> Self {
        Self {
            result: ScenarioResult {
                consumer: "worker-1".to_string(),
                scenario_id: Uuid::new_v4(),
                result: json!({ "value": 1.0 }),
                timestamp: Utc::now(),
                duration_sec: 0.01,
                success: true,
                model_version: None,
            },
        }
    }

    pub fn with_consumer(mut self, consumer: &str) -> Self {
        self.result.consumer = consumer.to_string();
        self
    }

    pub fn with_scenario_id(mut self, scenario_id: Uuid) -> Self {
        self.result.scenario_id = scenario_id;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.result.result = output;
        self
    }

    pub fn with_model_version(mut self, version: &str) -> Self {
        self.result.model_version = Some(version.to_string());
        self
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.result.success = false;
        self.result.result = json!({ "error": error });
        self
    }

    pub fn build(self) -> ScenarioResult {
        self.result
    }
}

impl Default for ResultBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for WorkerStats messages
pub struct WorkerStatsBuilder {
    consumer: String,
    processed: u64,
    errors: u64,
    uptime_sec: f64,
    model_version: Option<String>,
}

impl WorkerStatsBuilder {
    pub fn new(consumer: &str) -> Self {
        Self {
            consumer: consumer.to_string(),
            processed: 0,
            errors: 0,
            uptime_sec: 30.0,
            model_version: None,
        }
    }

    pub fn with_processed(mut self, processed: u64) -> Self {
        self.processed = processed;
        self
    }

    pub fn with_uptime(mut self, uptime_sec: f64) -> Self {
        self.uptime_sec = uptime_sec;
        self
    }

    pub fn with_model_version(mut self, version: &str) -> Self {
        self.model_version = Some(version.to_string());
        self
    }

    pub fn build(self) -> WorkerStats {
        WorkerStats::new(
            &self.consumer,
            self.processed,
            self.errors,
            self.uptime_sec,
            self.model_version,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_builder_failed() {
        let result = ResultBuilder::new().failed("boom").build();
        assert!(!result.success);
        assert_eq!(result.error_message(), Some("boom"));
    }

    #[test]
    fn test_stats_builder_computes_rate() {
        let stats = WorkerStatsBuilder::new("w")
            .with_processed(60)
            .with_uptime(30.0)
            .build();
        assert_eq!(stats.rate, 2.0);
    }
}
