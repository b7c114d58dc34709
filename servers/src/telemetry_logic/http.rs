use crate::telemetry_logic::monitor;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use lib_telemetry::{ConsumerView, DeviceState, HistoryCursor, LinkState, Snapshot};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    view: ConsumerView,
    link: watch::Receiver<LinkState>,
    stale_after: Duration,
}

impl AppState {
    pub fn new(
        view: ConsumerView,
        link: watch::Receiver<LinkState>,
        stale_after: Duration,
    ) -> Self {
        Self {
            view,
            link,
            stale_after,
        }
    }

    fn is_stale(&self) -> bool {
        monitor::is_stale(&self.view, self.stale_after)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub link: LinkState,
    pub snapshots: usize,
    pub last_snapshot_age_ms: Option<i64>,
    /// True while no snapshot has arrived within the staleness threshold.
    pub waiting_for_data: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<u64>,
    pub after: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .route("/history", get(history_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("HTTP API shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    let link = *state.link.borrow();
    Json(HealthReport {
        link,
        snapshots: state.view.history_len(),
        last_snapshot_age_ms: state.view.last_snapshot_age().map(|age| age.num_milliseconds()),
        waiting_for_data: state.is_stale(),
    })
}

async fn state_handler(State(state): State<AppState>) -> Json<DeviceState> {
    Json(state.view.current_state())
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let cursor = match (query.since, query.after) {
        (Some(_), Some(_)) => {
            let body = ErrorBody {
                error: "use either 'since' or 'after', not both".to_string(),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
        (Some(seq), None) => HistoryCursor::Sequence(seq),
        (None, Some(at)) => HistoryCursor::Since(at),
        (None, None) => HistoryCursor::Start,
    };

    let snapshots: Vec<Snapshot> = state
        .view
        .history_since(cursor)
        .iter()
        .map(|snapshot| snapshot.as_ref().clone())
        .collect();
    Json(snapshots).into_response()
}
