use std::sync::Arc;

use axum::{extract::Query, extract::State, routing::get, Json, Router};
use serde::Deserialize;
use tracing::debug;

use crate::{IngestContext, RecordView, SensorRecord};

// ---

pub fn router() -> Router<Arc<IngestContext>> {
    // ---
    Router::new().route("/api/data", get(handler))
}

/// Current store snapshot, most recent first. Never fails on ingestion state.
async fn handler(
    Query(params): Query<DataQuery>,
    State(ctx): State<Arc<IngestContext>>,
) -> Json<Vec<RecordView>> {
    // ---
    let snapshot = ctx.store().snapshot();
    let tz = ctx.display_tz();

    let views: Vec<RecordView> = apply_filters(snapshot, &params)
        .iter()
        .map(|record| record.view(tz))
        .collect();

    debug!("GET /api/data - returning {} records", views.len());
    Json(views)
}

/// Query parameters for filtering the snapshot
#[derive(Debug, Default, Deserialize)]
pub struct DataQuery {
    device_id: Option<String>,
    limit: Option<usize>,
}

/// Apply query filters to a snapshot, preserving its order
fn apply_filters(records: Vec<Arc<SensorRecord>>, params: &DataQuery) -> Vec<Arc<SensorRecord>> {
    // ---
    records
        .into_iter()
        .filter(|r| {
            params
                .device_id
                .as_ref()
                .map_or(true, |id| r.device_id() == id)
        })
        .take(params.limit.unwrap_or(usize::MAX))
        .collect()
}
