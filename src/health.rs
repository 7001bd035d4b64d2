//! Health check endpoints (/healthz, /readyz).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tracing::info;

/// Shared readiness state plus the time of the last completed cycle.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    last_cycle_unix: Arc<AtomicI64>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn record_cycle(&self, at: DateTime<Utc>) {
        self.last_cycle_unix.store(at.timestamp(), Ordering::SeqCst);
    }

    pub fn last_cycle(&self) -> Option<DateTime<Utc>> {
        match self.last_cycle_unix.load(Ordering::SeqCst) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<HealthState>) -> (StatusCode, String) {
    let last = state
        .last_cycle()
        .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
    if state.is_ready() {
        (StatusCode::OK, format!("last cycle: {last}"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, format!("last cycle: {last}"))
    }
}

/// Start the health server on the given port.
pub async fn serve(port: u16, state: HealthState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "Health server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
