//! HTTP gateway for the ingestion service.
//!
//! Each sibling module exports a subrouter; this gateway merges them and
//! attaches the shared ingestion context so `main.rs` never needs to know
//! about individual endpoints.

use std::sync::Arc;

use axum::Router;

use crate::IngestContext;

mod data;
mod health;
mod ingestion;
mod inject;
mod push;
mod status;

// ---

pub fn router(ctx: Arc<IngestContext>) -> Router {
    // ---
    Router::new()
        .merge(data::router())
        .merge(status::router())
        .merge(push::router())
        .merge(inject::router())
        .merge(ingestion::router())
        .merge(health::router())
        .with_state(ctx)
}
