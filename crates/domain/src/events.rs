//! 广播事件
//!
//! `BusEvent` 走消息代理（更新总线与看板总线），`DashboardEvent` 推送给看板观察者。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scenario::{ScenarioResult, WorkerStats};
use crate::snapshot::AggregateSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BusEvent {
    /// 通知 Worker 重新拉取模型
    #[serde(rename_all = "camelCase")]
    ModelUpdated {
        new_version: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    /// 通知聚合端模型已切换
    ModelChanged(ModelChangedEvent),
}

impl BusEvent {
    pub fn model_updated(new_version: impl Into<String>) -> Self {
        BusEvent::ModelUpdated {
            new_version: new_version.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn new_version(&self) -> &str {
        match self {
            BusEvent::ModelUpdated { new_version, .. } => new_version,
            BusEvent::ModelChanged(event) => &event.new_version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelChangedEvent {
    pub new_version: String,
    /// 模型来源的可读标签（通常是文件名）
    pub model_label: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ModelChangedEvent {
    pub fn new(new_version: impl Into<String>, model_label: impl Into<String>) -> Self {
        Self {
            new_version: new_version.into(),
            model_label: model_label.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimulationFinishedEvent {
    pub total_processed: u64,
    pub total_errors: u64,
    pub timestamp: DateTime<Utc>,
}

/// 推送给看板的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum DashboardEvent {
    Result(ScenarioResult),
    MetricsUpdate(Box<AggregateSnapshot>),
    Stats(WorkerStats),
    ModelChanged(ModelChangedEvent),
    SimulationFinished(SimulationFinishedEvent),
}

impl DashboardEvent {
    /// SSE 事件名
    pub fn name(&self) -> &'static str {
        match self {
            DashboardEvent::Result(_) => "result",
            DashboardEvent::MetricsUpdate(_) => "metricsUpdate",
            DashboardEvent::Stats(_) => "stats",
            DashboardEvent::ModelChanged(_) => "modelChanged",
            DashboardEvent::SimulationFinished(_) => "simulationFinished",
        }
    }
}
