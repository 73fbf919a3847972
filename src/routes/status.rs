//! Diagnostics endpoint: connection state, counters and the last failure.
//!
//! Reads only in-memory state (the store lock, atomics and the published
//! connection snapshot), so it stays responsive while the broker is down.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::ConnectionSnapshot;
use crate::models::DISPLAY_FORMAT;
use crate::telemetry::CountersSnapshot;
use crate::IngestContext;

// ---

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    connection: ConnectionSnapshot,
    ingestion_enabled: bool,
    record_count: usize,
    capacity: usize,
    #[serde(flatten)]
    counters: CountersSnapshot,
    server_time: String,
    server_time_utc: DateTime<Utc>,
}

async fn status(State(ctx): State<Arc<IngestContext>>) -> Json<StatusResponse> {
    // ---
    let now = Utc::now();
    Json(StatusResponse {
        connection: ctx.connection(),
        ingestion_enabled: ctx.is_enabled(),
        record_count: ctx.store().len(),
        capacity: ctx.store().capacity(),
        counters: ctx.counters().snapshot(),
        server_time: now
            .with_timezone(&ctx.display_tz())
            .format(DISPLAY_FORMAT)
            .to_string(),
        server_time_utc: now,
    })
}

pub fn router() -> Router<Arc<IngestContext>> {
    Router::new().route("/api/status", get(status))
}
