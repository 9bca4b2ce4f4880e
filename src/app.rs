use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use montecarlo_aggregator::Aggregator;
use montecarlo_config::AppConfig;
use montecarlo_infrastructure::{amqp_connector, BrokerConnector};
use montecarlo_observability::MetricsCollector;
use montecarlo_producer::{ModelFileWatcher, SimulationController};
use montecarlo_worker::{EvaluatorPolicy, ExpressionEvaluator, MonteCarloWorker};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 发布模型并填充工作队列
    Producer,
    /// 消费场景并回报结果
    Worker,
    /// 汇总结果，可选地提供看板接口
    Aggregator,
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "producer" => Ok(AppMode::Producer),
            "worker" => Ok(AppMode::Worker),
            "aggregator" => Ok(AppMode::Aggregator),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    connector: Arc<dyn BrokerConnector>,
    metrics: Arc<MetricsCollector>,
}

impl Application {
    /// 使用 RabbitMQ 连接器创建应用实例
    pub fn new(config: AppConfig, mode: AppMode) -> Self {
        let connector = amqp_connector(&config);
        Self::with_connector(config, mode, connector)
    }

    pub fn with_connector(
        config: AppConfig,
        mode: AppMode,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        info!("初始化应用程序，模式: {:?}", mode);
        Self {
            config,
            mode,
            connector,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行直到收到关闭信号；Worker 启动失败时提前返回错误
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Producer => self.run_producer(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::Aggregator => self.run_aggregator(shutdown_rx).await,
        }
    }

    async fn run_producer(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let controller = Arc::new(
            SimulationController::new(self.connector.clone(), &self.config, self.metrics.clone())
                .context("创建模拟控制器失败")?,
        );

        let mut handles = vec![controller
            .initialize(shutdown_rx.resubscribe())
            .await
            .context("初始化模拟失败")?];

        if self.config.producer.watch_model_file {
            let watcher = ModelFileWatcher::new(
                controller.clone(),
                Duration::from_secs(self.config.producer.watch_interval_seconds),
            );
            watcher.prime().await;
            handles.push(watcher.spawn(shutdown_rx.resubscribe()));
        }

        let _ = shutdown_rx.recv().await;
        info!("停止场景生产");
        controller.stop().await;
        join_all(handles).await;

        let status = controller.status().await;
        info!(
            total_published = status.total_published,
            model_version = status.model_version.as_deref().unwrap_or("-"),
            "场景生产已停止"
        );
        if let Err(e) = controller.close().await {
            warn!("关闭生产端连接失败: {}", e);
        }
        Ok(())
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let evaluator = Arc::new(ExpressionEvaluator::new(EvaluatorPolicy::from(
            &self.config.evaluator,
        )));
        let worker = MonteCarloWorker::new(
            &self.config.worker.worker_id,
            self.connector.clone(),
            &self.config,
            evaluator,
            self.metrics.clone(),
        )
        .context("创建Worker失败")?;

        let summary = worker.run(shutdown_rx).await.context("Worker异常退出")?;
        info!(processed = summary.processed, errors = summary.errors, "Worker已退出");
        Ok(())
    }

    async fn run_aggregator(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let aggregator = Arc::new(Aggregator::new(
            self.connector.clone(),
            &self.config,
            self.metrics.clone(),
        ));
        let mut handles = aggregator.start(shutdown_rx.resubscribe());

        if self.config.api.enabled {
            let api_aggregator = aggregator.clone();
            let api_config = self.config.api.clone();
            let api_shutdown = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = montecarlo_api::serve(api_aggregator, &api_config, api_shutdown).await
                {
                    error!("看板接口运行失败: {:#}", e);
                }
            }));
        }

        let _ = shutdown_rx.recv().await;
        join_all(handles).await;

        let snapshot = aggregator.snapshot().await;
        info!(
            total_processed = snapshot.total_processed,
            total_errors = snapshot.total_errors,
            "聚合器已停止"
        );
        Ok(())
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("后台任务异常结束: {}", e);
        }
    }
}
