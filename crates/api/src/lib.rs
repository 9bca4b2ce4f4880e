//! # Montecarlo API
//!
//! 聚合器的看板接口，基于Axum构建。
//!
//! ## API 端点
//!
//! - `GET /health` - 健康检查
//! - `GET /api/metrics` - 当前聚合快照
//! - `POST /api/metrics/reset` - 手动重置指标（看板的 resetMetrics 命令）
//! - `GET /api/events` - SSE 事件流：`result`、`metricsUpdate`、`stats`、`modelChanged`、`simulationFinished`
//!
//! ## 使用示例
//!
//! ```bash
//! curl http://localhost:5000/api/metrics
//! curl -X POST http://localhost:5000/api/metrics/reset
//! curl -N http://localhost:5000/api/events
//! ```

pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use anyhow::{Context, Result};
use axum::Router;
use montecarlo_aggregator::Aggregator;
use montecarlo_config::ApiConfig;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tracing::info;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(aggregator: Arc<Aggregator>, api_config: &ApiConfig) -> Router {
    let router = create_routes(AppState { aggregator }).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if api_config.cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    }
}

/// 绑定地址并运行，直到收到关闭信号
pub async fn serve(
    aggregator: Arc<Aggregator>,
    api_config: &ApiConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = create_app(aggregator, api_config);
    let listener = TcpListener::bind(&api_config.bind_address)
        .await
        .with_context(|| format!("绑定看板地址失败: {}", api_config.bind_address))?;
    info!("看板接口监听于 {}", api_config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("看板接口正在关闭");
        })
        .await
        .context("看板接口运行失败")
}
