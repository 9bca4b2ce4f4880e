use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 一个待计算的模拟场景，创建后不再修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: Uuid,
    pub index: u64,
    pub created_at: DateTime<Utc>,
    /// 生成场景时生产者所知的模型版本
    pub model_version: Option<String>,
    pub payload: Map<String, Value>,
    pub metadata: ScenarioMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioMetadata {
    pub batch_timestamp: DateTime<Utc>,
    pub distribution_types: Vec<String>,
}

impl Scenario {
    /// 场景是否针对另一个模型版本生成
    pub fn targets_other_version(&self, current: Option<&str>) -> bool {
        match (self.model_version.as_deref(), current) {
            (Some(tagged), Some(current)) => tagged != current,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Worker 对单个场景的计算结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub consumer: String,
    pub scenario_id: Uuid,
    /// 成功时为模型输出，失败时为 {"error": "..."}
    pub result: Value,
    pub timestamp: DateTime<Utc>,
    pub duration_sec: f64,
    pub success: bool,
    pub model_version: Option<String>,
}

impl ScenarioResult {
    pub fn success(
        consumer: &str,
        scenario: &Scenario,
        output: Map<String, Value>,
        duration_sec: f64,
        model_version: Option<String>,
    ) -> Self {
        Self {
            consumer: consumer.to_string(),
            scenario_id: scenario.id,
            result: Value::Object(output),
            timestamp: Utc::now(),
            duration_sec,
            success: true,
            model_version,
        }
    }

    pub fn failure(
        consumer: &str,
        scenario: &Scenario,
        error: impl Into<String>,
        duration_sec: f64,
        model_version: Option<String>,
    ) -> Self {
        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(error.into()));
        Self {
            consumer: consumer.to_string(),
            scenario_id: scenario.id,
            result: Value::Object(body),
            timestamp: Utc::now(),
            duration_sec,
            success: false,
            model_version,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        self.result.get("error").and_then(Value::as_str)
    }
}

/// Worker 周期性上报的累计统计，聚合端只保留最新一份
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub consumer: String,
    pub processed: u64,
    pub errors: u64,
    pub uptime_sec: f64,
    pub rate: f64,
    pub model_version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkerStats {
    pub fn new(
        consumer: &str,
        processed: u64,
        errors: u64,
        uptime_sec: f64,
        model_version: Option<String>,
    ) -> Self {
        let rate = if uptime_sec > 0.0 {
            processed as f64 / uptime_sec
        } else {
            0.0
        };
        Self {
            consumer: consumer.to_string(),
            processed,
            errors,
            uptime_sec,
            rate,
            model_version,
            timestamp: Utc::now(),
        }
    }
}
