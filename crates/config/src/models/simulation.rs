use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 模型槽位（容量为1的队列）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelChannelConfig {
    /// 模型消息及队列的存活时间（毫秒）
    pub ttl_ms: u64,
    /// 删除旧槽位后等待的时间（毫秒）
    pub invalidation_grace_ms: u64,
    /// 轮询模型槽位的间隔（秒）
    pub poll_interval_seconds: u64,
    /// 轮询出现传输错误后的等待（秒）
    pub retry_after_error_seconds: u64,
}

impl Default for ModelChannelConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            invalidation_grace_ms: 300,
            poll_interval_seconds: 2,
            retry_after_error_seconds: 3,
        }
    }
}

impl ConfigValidator for ModelChannelConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_positive(self.ttl_ms, "model.ttl_ms")?;
        ValidationUtils::validate_timeout_seconds(
            self.poll_interval_seconds,
            "model.poll_interval_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.retry_after_error_seconds,
            "model.retry_after_error_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub model_file: String,
    /// 队列水位线：低于该值时补充场景
    pub min_scenarios: u32,
    /// 队列硬上限（x-max-length）
    pub max_scenarios: u32,
    pub batch_size: u32,
    pub scenario_ttl_ms: u64,
    pub fast_tick_ms: u64,
    pub slow_tick_ms: u64,
    pub failure_backoff_seconds: u64,
    /// 连续失败多少个周期后进入长退避
    pub failure_threshold: u32,
    pub configure_attempts: u32,
    pub configure_retry_delay_seconds: u64,
    pub watch_model_file: bool,
    pub watch_interval_seconds: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            model_file: "models/traffic.model".to_string(),
            min_scenarios: 2000,
            max_scenarios: 50_000,
            batch_size: 1000,
            scenario_ttl_ms: 3_600_000,
            fast_tick_ms: 500,
            slow_tick_ms: 3000,
            failure_backoff_seconds: 10,
            failure_threshold: 3,
            configure_attempts: 3,
            configure_retry_delay_seconds: 2,
            watch_model_file: true,
            watch_interval_seconds: 5,
        }
    }
}

impl ConfigValidator for ProducerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.model_file, "producer.model_file")?;
        ValidationUtils::validate_positive(self.min_scenarios.into(), "producer.min_scenarios")?;
        ValidationUtils::validate_positive(self.batch_size.into(), "producer.batch_size")?;
        ValidationUtils::validate_positive(self.scenario_ttl_ms, "producer.scenario_ttl_ms")?;
        ValidationUtils::validate_positive(self.fast_tick_ms, "producer.fast_tick_ms")?;
        ValidationUtils::validate_positive(self.slow_tick_ms, "producer.slow_tick_ms")?;
        ValidationUtils::validate_positive(
            self.configure_attempts.into(),
            "producer.configure_attempts",
        )?;
        ValidationUtils::validate_positive(
            self.failure_threshold.into(),
            "producer.failure_threshold",
        )?;

        if self.min_scenarios > self.max_scenarios {
            return Err(crate::ConfigError::Validation(
                "producer.min_scenarios must not exceed producer.max_scenarios".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 为空时使用 主机名-进程号
    pub worker_id: String,
    pub startup_wait_seconds: u64,
    pub reload_wait_seconds: u64,
    pub stats_interval_seconds: u64,
    pub progress_log_every: u64,
    pub consume_attempts: u32,
    pub consume_retry_delay_seconds: u64,
    pub reconnect_delay_seconds: u64,
    pub update_listener_reconnect_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            startup_wait_seconds: 120,
            reload_wait_seconds: 30,
            stats_interval_seconds: 30,
            progress_log_every: 50,
            consume_attempts: 3,
            consume_retry_delay_seconds: 2,
            reconnect_delay_seconds: 5,
            update_listener_reconnect_seconds: 5,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.startup_wait_seconds,
            "worker.startup_wait_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.reload_wait_seconds,
            "worker.reload_wait_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.stats_interval_seconds,
            "worker.stats_interval_seconds",
        )?;
        ValidationUtils::validate_positive(self.progress_log_every, "worker.progress_log_every")?;
        ValidationUtils::validate_positive(
            self.consume_attempts.into(),
            "worker.consume_attempts",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// 滚动结果窗口大小
    pub history_size: usize,
    /// 每个数值指标保留的序列长度
    pub series_capacity: usize,
    /// 去重集合的容量上限
    pub seen_ids_capacity: usize,
    pub idle_threshold_seconds: u64,
    pub watchdog_interval_ms: u64,
    pub model_probe_interval_seconds: u64,
    pub reconnect_delay_seconds: u64,
    pub event_buffer: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            series_capacity: 1000,
            seen_ids_capacity: 1_000_000,
            idle_threshold_seconds: 5,
            watchdog_interval_ms: 1000,
            model_probe_interval_seconds: 10,
            reconnect_delay_seconds: 3,
            event_buffer: 1024,
        }
    }
}

impl ConfigValidator for AggregatorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_positive(self.history_size as u64, "aggregator.history_size")?;
        ValidationUtils::validate_positive(
            self.series_capacity as u64,
            "aggregator.series_capacity",
        )?;
        ValidationUtils::validate_positive(
            self.seen_ids_capacity as u64,
            "aggregator.seen_ids_capacity",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.idle_threshold_seconds,
            "aggregator.idle_threshold_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.watchdog_interval_ms,
            "aggregator.watchdog_interval_ms",
        )?;
        ValidationUtils::validate_positive(self.event_buffer as u64, "aggregator.event_buffer")?;
        Ok(())
    }
}

/// 模型求值器的沙箱策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub entry_point: String,
    pub max_source_bytes: usize,
    pub max_statements: usize,
    /// 表达式嵌套层数和语法树高度的上限
    pub max_depth: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            entry_point: "model_fn".to_string(),
            max_source_bytes: 64 * 1024,
            max_statements: 256,
            max_depth: 64,
        }
    }
}

impl ConfigValidator for EvaluatorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.entry_point, "evaluator.entry_point")?;
        ValidationUtils::validate_positive(
            self.max_source_bytes as u64,
            "evaluator.max_source_bytes",
        )?;
        ValidationUtils::validate_positive(
            self.max_statements as u64,
            "evaluator.max_statements",
        )?;
        ValidationUtils::validate_positive(self.max_depth as u64, "evaluator.max_depth")?;
        Ok(())
    }
}
