use montecarlo_config::AppConfig;
use montecarlo_domain::{BusEvent, ModelChangedEvent, ModelVersion};
use montecarlo_errors::{SimulationError, SimulationResult};
use montecarlo_infrastructure::{
    dashboard_queue_spec, BrokerConnector, JsonPublisher, ModelChannel, PublishOptions, UpdateBus,
};
use montecarlo_observability::MetricsCollector;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::producer::ScenarioProducer;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub messages: u32,
    pub consumers: u32,
    pub needs_more: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProductionLimits {
    pub min_scenarios: u32,
    pub max_scenarios: u32,
    pub batch_size: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SimulationStatus {
    pub running: bool,
    pub total_published: u64,
    pub model_version: Option<String>,
    pub model_file: String,
    /// 读取失败时为 None
    pub queue: Option<QueueStatus>,
    pub limits: ProductionLimits,
}

/// 模型所有者：发布模型、通知 Worker、驱动场景生产
pub struct SimulationController {
    producer: Arc<ScenarioProducer>,
    models: ModelChannel,
    updates: UpdateBus,
    dashboard: JsonPublisher,
    model_path: Mutex<PathBuf>,
    metrics: Arc<MetricsCollector>,
}

impl SimulationController {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        config: &AppConfig,
        metrics: Arc<MetricsCollector>,
    ) -> SimulationResult<Self> {
        let producer = ScenarioProducer::new(
            connector.clone(),
            &config.queues.scenarios,
            config.producer.clone(),
            metrics.clone(),
        )?;
        Ok(Self {
            producer: Arc::new(producer),
            models: ModelChannel::new(connector.clone(), &config.queues.model, config.model.clone()),
            updates: UpdateBus::new(connector.clone(), &config.queues.updates),
            dashboard: JsonPublisher::new(
                connector,
                dashboard_queue_spec(&config.queues.dashboard),
                PublishOptions::default(),
            ),
            model_path: Mutex::new(PathBuf::from(&config.producer.model_file)),
            metrics,
        })
    }

    pub fn producer(&self) -> Arc<ScenarioProducer> {
        self.producer.clone()
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_path
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 发布模型、配置队列、初始填充，然后在后台启动生产循环
    pub async fn initialize(
        &self,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> SimulationResult<JoinHandle<()>> {
        let path = self.model_path();
        let source = read_model_file(&path).await?;
        let model = self.models.publish(&source).await?;
        self.metrics.record_model_publication();
        self.producer.set_model_version(Some(model.version.clone()));

        self.producer.configure_queue().await?;
        self.producer.initial_fill().await?;

        info!(
            version = %model.short_id(),
            model_file = %path.display(),
            "模拟已初始化，开始生产场景"
        );
        Ok(self.producer.start(shutdown_rx).await)
    }

    /// 重新读取模型文件（可以换一个路径）并发布为新版本
    pub async fn update_model(&self, path: Option<&Path>) -> SimulationResult<ModelVersion> {
        if let Some(path) = path {
            *self.model_path.lock().unwrap_or_else(|e| e.into_inner()) = path.to_path_buf();
        }
        let path = self.model_path();
        let source = read_model_file(&path).await?;

        let model = self.models.publish(&source).await?;
        self.metrics.record_model_publication();
        self.producer.set_model_version(Some(model.version.clone()));

        let event = BusEvent::ModelChanged(ModelChangedEvent::new(
            model.version.clone(),
            model_label(&path),
        ));
        self.dashboard.publish_best_effort(&event).await;

        if let Err(e) = self.updates.notify(&model.version).await {
            // Worker 仍会通过场景上的版本标记发现新模型
            warn!(version = %model.short_id(), "发送模型更新通知失败: {}", e);
        }

        info!(
            version = %model.short_id(),
            model_file = %path.display(),
            "模型已更新"
        );
        Ok(model)
    }

    pub async fn status(&self) -> SimulationStatus {
        let config = self.producer.config();
        let queue = self
            .producer
            .queue_state()
            .await
            .map(|state| QueueStatus {
                messages: state.message_count,
                consumers: state.consumer_count,
                needs_more: state.message_count < config.min_scenarios,
            })
            .ok();

        SimulationStatus {
            running: self.producer.is_running().await,
            total_published: self.producer.total_published(),
            model_version: self.producer.model_version(),
            model_file: self.model_path().display().to_string(),
            queue,
            limits: ProductionLimits {
                min_scenarios: config.min_scenarios,
                max_scenarios: config.max_scenarios,
                batch_size: config.batch_size,
            },
        }
    }

    pub async fn stop(&self) {
        self.producer.stop().await;
    }

    pub async fn close(&self) -> SimulationResult<()> {
        self.producer.close().await?;
        self.models.close().await?;
        self.updates.close().await?;
        self.dashboard.close().await
    }
}

async fn read_model_file(path: &Path) -> SimulationResult<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        SimulationError::config_error(format!("无法读取模型文件 {}: {}", path.display(), e))
    })
}

fn model_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_label_uses_file_name() {
        assert_eq!(model_label(Path::new("models/traffic.model")), "traffic.model");
        assert_eq!(model_label(Path::new("/")), "/");
    }
}
