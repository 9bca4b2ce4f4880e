//! Test helper utilities

use montecarlo_config::AppConfig;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

/// 一个简单的有效模型：两个输出，其中一个依赖常量
pub const SIMPLE_MODEL: &str = "\
[constants]
factor = 2

[model_fn]
value = uniform * factor
high = custom_normal > 50
";

pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    ///
    /// Uses the tokio clock, so it also works under `start_paused = true`.
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(100)).await;
        }
        condition().await
    }
}

/// 适合测试的小规模配置：水位和批量都很小，等待时间很短
pub fn small_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.model.invalidation_grace_ms = 10;
    config.model.poll_interval_seconds = 1;
    config.model.retry_after_error_seconds = 1;
    config.producer.min_scenarios = 20;
    config.producer.max_scenarios = 100;
    config.producer.batch_size = 10;
    config.producer.watch_interval_seconds = 1;
    config.worker.startup_wait_seconds = 10;
    config.worker.reload_wait_seconds = 5;
    config.worker.reconnect_delay_seconds = 1;
    config.worker.update_listener_reconnect_seconds = 1;
    config.aggregator.reconnect_delay_seconds = 1;
    config
}

/// 临时目录中的模型文件，目录随返回值一起释放
pub struct ModelFile {
    _dir: TempDir,
    pub path: PathBuf,
}

impl ModelFile {
    pub fn new(source: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.model");
        std::fs::write(&path, source)?;
        Ok(Self { _dir: dir, path })
    }

    pub fn rewrite(&self, source: &str) -> anyhow::Result<()> {
        std::fs::write(&self.path, source)?;
        // 部分文件系统的时间戳精度较粗，显式推后修改时间
        let file = std::fs::File::options().write(true).open(&self.path)?;
        let bumped = std::time::SystemTime::now() + Duration::from_secs(60);
        file.set_modified(bumped)?;
        Ok(())
    }

    pub fn path_str(&self) -> String {
        self.path.display().to_string()
    }
}
