//! 聚合快照：由运行计数器与滚动窗口推导出的只读视图

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::scenario::WorkerStats;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub total_processed: u64,
    pub total_errors: u64,
    pub active_workers: Vec<String>,
    pub worker_stats: BTreeMap<String, WorkerStats>,
    pub worker_performance: BTreeMap<String, WorkerPerformance>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub history_len: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_result_at: Option<DateTime<Utc>>,
    pub finished: bool,
    pub model_info: ModelInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPerformance {
    pub processed: u64,
    pub errors: u64,
    /// 百分比，0-100
    pub success_rate: f64,
}

impl WorkerPerformance {
    pub fn new(processed: u64, errors: u64) -> Self {
        let success_rate = if processed > 0 {
            (processed.saturating_sub(errors)) as f64 / processed as f64 * 100.0
        } else {
            0.0
        };
        Self {
            processed,
            errors,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Numeric,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub kind: MetricKind,
    pub count: u64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last: Option<f64>,
    /// 最近的数值序列，用于绘图
    pub series: Vec<f64>,
}

/// 模型槽位的观测信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub queue_state: String,
    pub message_count: u64,
    pub ttl_seconds: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub policy: String,
    pub version: String,
    pub model_label: String,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            queue_state: "unknown".to_string(),
            message_count: 0,
            ttl_seconds: 300,
            last_updated: None,
            policy: "expires when a new model is loaded".to_string(),
            version: "unknown".to_string(),
            model_label: "unknown".to_string(),
        }
    }
}
