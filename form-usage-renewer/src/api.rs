use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::renewer::Renewer;
use crate::stats::RenewalStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub running: bool,
    pub scheduled: bool,
}

async fn health_check(State(renewer): State<Renewer>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        running: renewer.is_running(),
        scheduled: renewer.is_scheduled(),
    })
}

/// Counts of the last completed renewal pass, 404 until one completed
async fn statistics(State(renewer): State<Renewer>) -> Result<Json<RenewalStats>, StatusCode> {
    renewer
        .last_statistics()
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub fn app(renewer: Renewer) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/renewer/statistics", get(statistics))
        .with_state(renewer)
}

pub async fn serve(renewer: Renewer, port: u16) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("Serving renewer statistics on {}", listener.local_addr()?);
    axum::serve(listener, app(renewer)).await
}
