use std::sync::Arc;

use axum::{body::Bytes, extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::error::PushError;
use crate::IngestContext;

// ---

pub fn router() -> Router<Arc<IngestContext>> {
    // ---
    Router::new().route("/api/push", post(handler))
}

/// Webhook-style ingress. The body is taken raw so that non-JSON input is
/// reported as `invalid_encoding` rather than by the extractor.
async fn handler(
    State(ctx): State<Arc<IngestContext>>,
    body: Bytes,
) -> Result<Json<Value>, PushError> {
    // ---
    let record = ctx.on_external_push(&body)?;
    info!("POST /api/push - accepted uplink from {}", record.device_id());

    Ok(Json(json!({
        "status": "ok",
        "record": record.view(ctx.display_tz()),
    })))
}
