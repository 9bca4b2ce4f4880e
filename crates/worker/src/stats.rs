use montecarlo_domain::WorkerStats;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Worker 自启动以来的累计计数
#[derive(Debug)]
pub struct WorkerCounters {
    processed: AtomicU64,
    errors: AtomicU64,
    started: Instant,
}

impl Default for WorkerCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerCounters {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// 记录一个已处理的场景，返回新的处理总数
    pub fn record(&self, success: bool) -> u64 {
        if !success {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn rate(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs > 0.0 {
            self.processed() as f64 / secs
        } else {
            0.0
        }
    }

    pub fn snapshot(&self, worker_id: &str, model_version: Option<String>) -> WorkerStats {
        WorkerStats::new(
            worker_id,
            self.processed(),
            self.errors(),
            self.uptime().as_secs_f64(),
            model_version,
        )
    }

    pub fn summary(&self, worker_id: &str) -> WorkerSummary {
        WorkerSummary {
            worker_id: worker_id.to_string(),
            uptime: self.uptime(),
            processed: self.processed(),
            errors: self.errors(),
            rate: self.rate(),
        }
    }
}

/// 关闭时输出的运行摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub worker_id: String,
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
    pub processed: u64,
    pub errors: u64,
    pub rate: f64,
}

impl fmt::Display for WorkerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Worker {} | 运行时间: {:.1}s | 已处理: {} | 速率: {:.2}/s | 错误: {}",
            self.worker_id,
            self.uptime.as_secs_f64(),
            self.processed,
            self.rate,
            self.errors
        )
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
