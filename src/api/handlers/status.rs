//! Pool and reverse proxy status

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::server::AppState;
use crate::error::Result;
use crate::haproxy::ProxyStatus;
use crate::rotation::PoolStatus;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub shutting_down: bool,
    pub proxy: ProxyStatus,
    pub pool: PoolStatus,
    pub leased_ports: Vec<u16>,
}

/// Current backends, reload history and pool counters
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at_utc,
        uptime_secs: state.started_at.elapsed().as_secs(),
        shutting_down: state.is_shutting_down(),
        proxy: state.proxy.status(),
        pool: state.scheduler.status(),
        leased_ports: state.ports.in_use(),
    }))
}
