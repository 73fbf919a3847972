use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::error::PushError;
use crate::IngestContext;

// ---

pub fn router() -> Router<Arc<IngestContext>> {
    Router::new().route("/api/test", post(handler))
}

/// Append one synthetic record through the regular ingress path.
async fn handler(State(ctx): State<Arc<IngestContext>>) -> Result<Json<Value>, PushError> {
    // ---
    let record = ctx.inject_test_record()?;
    info!("POST /api/test - injected synthetic record");

    Ok(Json(json!({
        "status": "ok",
        "record": record.view(ctx.display_tz()),
    })))
}
