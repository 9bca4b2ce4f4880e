use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use montecarlo_domain::DashboardEvent;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::routes::AppState;

/// 看板事件的 SSE 推送，事件名即 `DashboardEvent::name`
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let receiver = state.aggregator.subscribe();
    debug!("新的看板观察者已连接");

    Sse::new(dashboard_events(receiver)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn dashboard_events(
    receiver: broadcast::Receiver<DashboardEvent>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((to_sse_event(&event), receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("看板观察者处理过慢，跳过 {} 个事件", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

pub fn to_sse_event(event: &DashboardEvent) -> Result<Event, axum::Error> {
    let sse = Event::default().event(event.name());
    match event {
        DashboardEvent::Result(result) => sse.json_data(result),
        DashboardEvent::MetricsUpdate(snapshot) => sse.json_data(snapshot),
        DashboardEvent::Stats(stats) => sse.json_data(stats),
        DashboardEvent::ModelChanged(changed) => sse.json_data(changed),
        DashboardEvent::SimulationFinished(finished) => sse.json_data(finished),
    }
}
