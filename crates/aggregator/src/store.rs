//! 聚合状态
//!
//! `MetricsStore` 本身不加锁，由 [`crate::Aggregator`] 放在一把互斥锁后面，
//! 三个监听器、看门狗和重置命令都通过这把锁串行修改它。

use chrono::{DateTime, Utc};
use montecarlo_config::AggregatorConfig;
use montecarlo_domain::{
    model::short_version, AggregateSnapshot, MetricKind, MetricSummary, ModelChangedEvent,
    ModelInfo, ScenarioResult, SimulationFinishedEvent, WorkerPerformance, WorkerStats,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// 容量有限的已见场景集合，超出容量时淘汰最早加入的 id
#[derive(Debug)]
pub struct SeenIds {
    capacity: usize,
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// 首次出现时返回 true
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Accepted,
    Duplicate,
}

/// 模型槽位探测的结果
#[derive(Debug, Clone, PartialEq)]
pub enum SlotObservation {
    Active {
        message_count: u32,
        version: Option<String>,
    },
    Missing,
    Error(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerLoad {
    processed: u64,
    errors: u64,
}

#[derive(Debug)]
struct MetricAccumulator {
    kind: MetricKind,
    count: u64,
    numeric_count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    last: Option<f64>,
    series: VecDeque<f64>,
}

impl MetricAccumulator {
    fn new() -> Self {
        Self {
            kind: MetricKind::Other,
            count: 0,
            numeric_count: 0,
            sum: 0.0,
            min: None,
            max: None,
            last: None,
            series: VecDeque::new(),
        }
    }

    fn observe(&mut self, value: &Value, series_capacity: usize) {
        self.count += 1;
        let Some(number) = numeric_value(value) else {
            return;
        };
        // 一旦出现过数值就按数值指标处理
        self.kind = MetricKind::Numeric;
        self.numeric_count += 1;
        self.sum += number;
        self.min = Some(self.min.map_or(number, |min| min.min(number)));
        self.max = Some(self.max.map_or(number, |max| max.max(number)));
        self.last = Some(number);
        self.series.push_back(number);
        while self.series.len() > series_capacity {
            self.series.pop_front();
        }
    }

    fn summary(&self) -> MetricSummary {
        let mean = (self.numeric_count > 0).then(|| self.sum / self.numeric_count as f64);
        MetricSummary {
            kind: self.kind,
            count: self.count,
            mean,
            min: self.min,
            max: self.max,
            last: self.last,
            series: self.series.iter().copied().collect(),
        }
    }
}

/// 布尔值按 0/1 计入数值指标
fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[derive(Debug)]
pub struct MetricsStore {
    history_size: usize,
    series_capacity: usize,
    seen_capacity: usize,
    seen: SeenIds,
    total_processed: u64,
    total_errors: u64,
    active_workers: BTreeSet<String>,
    worker_stats: BTreeMap<String, WorkerStats>,
    workload: BTreeMap<String, WorkerLoad>,
    history: VecDeque<ScenarioResult>,
    metrics: BTreeMap<String, MetricAccumulator>,
    started_at: Option<DateTime<Utc>>,
    last_result_at: Option<DateTime<Utc>>,
    last_result_instant: Option<Instant>,
    finished: bool,
    model_info: ModelInfo,
}

impl MetricsStore {
    pub fn new(config: &AggregatorConfig, model_ttl: Duration) -> Self {
        let model_info = ModelInfo {
            ttl_seconds: model_ttl.as_secs(),
            ..ModelInfo::default()
        };
        Self::with_model_info(
            config.history_size,
            config.series_capacity,
            config.seen_ids_capacity,
            model_info,
        )
    }

    fn with_model_info(
        history_size: usize,
        series_capacity: usize,
        seen_capacity: usize,
        model_info: ModelInfo,
    ) -> Self {
        Self {
            history_size: history_size.max(1),
            series_capacity: series_capacity.max(1),
            seen_capacity,
            seen: SeenIds::new(seen_capacity),
            total_processed: 0,
            total_errors: 0,
            active_workers: BTreeSet::new(),
            worker_stats: BTreeMap::new(),
            workload: BTreeMap::new(),
            history: VecDeque::new(),
            metrics: BTreeMap::new(),
            started_at: None,
            last_result_at: None,
            last_result_instant: None,
            finished: false,
            model_info,
        }
    }

    pub fn record_result(&mut self, result: &ScenarioResult) -> ResultOutcome {
        if !self.seen.insert(result.scenario_id) {
            return ResultOutcome::Duplicate;
        }

        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.last_result_at = Some(now);
        self.last_result_instant = Some(Instant::now());
        self.finished = false;

        self.total_processed += 1;
        if !result.success {
            self.total_errors += 1;
        }

        if !result.consumer.is_empty() {
            self.active_workers.insert(result.consumer.clone());
            let load = self.workload.entry(result.consumer.clone()).or_default();
            load.processed += 1;
            if !result.success {
                load.errors += 1;
            }
        }

        // 失败结果只有 error 字段，不参与指标发现
        if result.success {
            if let Value::Object(fields) = &result.result {
                for (name, value) in fields {
                    self.metrics
                        .entry(name.clone())
                        .or_insert_with(MetricAccumulator::new)
                        .observe(value, self.series_capacity);
                }
            }
        }

        self.history.push_back(result.clone());
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
        ResultOutcome::Accepted
    }

    /// 覆盖该 Worker 的最新统计
    pub fn record_stats(&mut self, stats: WorkerStats) {
        if stats.consumer.is_empty() {
            return;
        }
        self.active_workers.insert(stats.consumer.clone());
        self.worker_stats.insert(stats.consumer.clone(), stats);
    }

    /// 空闲超过阈值时返回一次结束事件，直到新结果到来前不再重复
    pub fn check_finished(&mut self, idle_threshold: Duration) -> Option<SimulationFinishedEvent> {
        let last = self.last_result_instant?;
        if self.finished || last.elapsed() <= idle_threshold {
            return None;
        }
        self.finished = true;
        Some(SimulationFinishedEvent {
            total_processed: self.total_processed,
            total_errors: self.total_errors,
            timestamp: Utc::now(),
        })
    }

    /// 新模型到来：丢弃全部计数和窗口，并记录新模型信息
    pub fn model_changed(&mut self, event: &ModelChangedEvent) {
        let model_info = ModelInfo {
            queue_state: "active".to_string(),
            message_count: 1,
            last_updated: Some(Utc::now()),
            version: short_version(&event.new_version).to_string(),
            model_label: event.model_label.clone(),
            ..self.model_info.clone()
        };
        *self = Self::with_model_info(
            self.history_size,
            self.series_capacity,
            self.seen_capacity,
            model_info,
        );
    }

    /// 手动重置，保留模型信息
    pub fn reset(&mut self) {
        let model_info = self.model_info.clone();
        *self = Self::with_model_info(
            self.history_size,
            self.series_capacity,
            self.seen_capacity,
            model_info,
        );
    }

    pub fn apply_slot_observation(&mut self, observation: SlotObservation) {
        let info = &mut self.model_info;
        info.last_updated = Some(Utc::now());
        match observation {
            SlotObservation::Active {
                message_count,
                version,
            } => {
                info.queue_state = "active".to_string();
                info.message_count = message_count as u64;
                if let Some(version) = version {
                    info.version = short_version(&version).to_string();
                }
            }
            SlotObservation::Missing => {
                info.queue_state = "missing".to_string();
                info.message_count = 0;
            }
            SlotObservation::Error(message) => {
                info.queue_state = format!("error: {}", message);
                info.message_count = 0;
            }
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.model_info
    }

    /// 滚动窗口中的结果，从旧到新
    pub fn history(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.history.iter()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let worker_performance = self
            .active_workers
            .iter()
            .map(|worker| {
                let load = self.workload.get(worker).copied().unwrap_or_default();
                (
                    worker.clone(),
                    WorkerPerformance::new(load.processed, load.errors),
                )
            })
            .collect();

        AggregateSnapshot {
            total_processed: self.total_processed,
            total_errors: self.total_errors,
            active_workers: self.active_workers.iter().cloned().collect(),
            worker_stats: self.worker_stats.clone(),
            worker_performance,
            metrics: self
                .metrics
                .iter()
                .map(|(name, metric)| (name.clone(), metric.summary()))
                .collect(),
            history_len: self.history.len(),
            started_at: self.started_at,
            last_result_at: self.last_result_at,
            finished: self.finished,
            model_info: self.model_info.clone(),
        }
    }
}
