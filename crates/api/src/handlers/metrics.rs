use axum::{extract::State, response::IntoResponse};

use crate::{
    response::{success, ApiResponse},
    routes::AppState,
};

/// 当前聚合快照
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    success(state.aggregator.snapshot().await)
}

/// 看板的 resetMetrics 命令，返回重置后的快照
pub async fn reset_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.aggregator.reset_metrics().await;
    ApiResponse::success_with_message(snapshot, "指标已重置")
}
