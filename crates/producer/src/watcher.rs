//! 模型文件监视
//!
//! 定期比较模型文件的修改时间，变化后调用 `update_model` 发布新版本。
//! 文件缺失或无法读取只记录日志，下个周期再试。

use montecarlo_errors::SimulationResult;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::controller::SimulationController;

pub struct ModelFileWatcher {
    controller: Arc<SimulationController>,
    interval: Duration,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ModelFileWatcher {
    pub fn new(controller: Arc<SimulationController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
            last_modified: Mutex::new(None),
        }
    }

    /// 记录当前修改时间作为基准，之后的变化才会触发更新
    pub async fn prime(&self) {
        let path = self.controller.model_path();
        *self.last_modified.lock().await = modified_time(&path).await;
    }

    /// 检查一次，发布了新模型时返回 true
    pub async fn check_once(&self) -> SimulationResult<bool> {
        let path = self.controller.model_path();
        let Some(modified) = modified_time(&path).await else {
            return Ok(false);
        };

        let mut last = self.last_modified.lock().await;
        if *last == Some(modified) {
            return Ok(false);
        }

        info!(model_file = %path.display(), "检测到模型文件变化");
        self.controller.update_model(None).await?;
        // 发布成功后才更新基准，失败时下个周期重试
        *last = Some(modified);
        Ok(true)
    }

    pub fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        if self.last_modified.lock().await.is_none() {
            self.prime().await;
        }
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;
        info!(
            model_file = %self.controller.model_path().display(),
            "模型文件监视已启动，间隔 {:?}",
            self.interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_once().await {
                        warn!("模型热更新失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("模型文件监视收到关闭信号");
                    break;
                }
            }
        }
    }
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    match tokio::fs::metadata(path).await.and_then(|meta| meta.modified()) {
        Ok(modified) => Some(modified),
        Err(e) => {
            warn!(model_file = %path.display(), "无法读取模型文件状态，跳过本次检查: {}", e);
            None
        }
    }
}
