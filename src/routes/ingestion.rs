use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ControlError;
use crate::IngestContext;

// ---

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<bool>,
}

pub fn router() -> Router<Arc<IngestContext>> {
    // ---
    Router::new().route("/api/ingestion", get(current).post(toggle))
}

async fn current(State(ctx): State<Arc<IngestContext>>) -> Json<ToggleResponse> {
    Json(ToggleResponse {
        enabled: ctx.is_enabled(),
        previous: None,
    })
}

/// Runtime switch for the connection manager. Enabling is refused with 409
/// when the service was started without broker credentials.
async fn toggle(
    State(ctx): State<Arc<IngestContext>>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<ToggleResponse>, ControlError> {
    // ---
    let previous = ctx.set_enabled(req.enabled).inspect_err(|e| {
        warn!("POST /api/ingestion - refused: {}", e);
    })?;
    if previous != req.enabled {
        info!("Ingestion {}", if req.enabled { "enabled" } else { "disabled" });
    }
    Ok(Json(ToggleResponse {
        enabled: req.enabled,
        previous: Some(previous),
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;

    use crate::routes::{router as gateway, test_support::*};
    use crate::IngestContext;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_toggle() {
        // ---
        let ctx = test_context();
        let mut rx = ctx.watch_enabled();

        let response = send(gateway(ctx.clone()), post_req("/api/ingestion", r#"{"enabled":false}"#)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["enabled"], false);
        assert_eq!(json["previous"], true);

        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());

        let json = body_json(send(gateway(ctx), get_req("/api/ingestion")).await).await;
        assert_eq!(json, serde_json::json!({ "enabled": false }));
    }

    #[tokio::test]
    async fn test_toggle_rejects_bad_body() {
        // ---
        let response = send(gateway(test_context()), post_req("/api/ingestion", r#"{"on":1}"#)).await;
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_enable_without_credentials_conflicts() {
        // ---
        let ctx = Arc::new(
            IngestContext::new(100, false, chrono_tz::UTC).with_broker_credentials(false),
        );

        let response = send(gateway(ctx.clone()), post_req("/api/ingestion", r#"{"enabled":true}"#)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["kind"], "missing_credentials");
        assert!(!ctx.is_enabled());

        let response = send(gateway(ctx), post_req("/api/ingestion", r#"{"enabled":false}"#)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
