//! Telemetry intake from the proxy.
//!
//! - `POST /internal/logs`       one record, `201 {success, id}`
//! - `POST /internal/logs/bulk`  `{logs: [...]}`, `201 {success, inserted, skipped}`

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use runwarden_core::domain::request_log::TelemetryRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::api::{ApiError, ApiJson, AppState, Internal};

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub logs: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub success: bool,
    pub inserted: usize,
    pub skipped: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/internal/logs", post(ingest_one))
        .route("/internal/logs/bulk", post(ingest_bulk))
}

async fn ingest_one(
    internal: Internal,
    State(state): State<AppState>,
    ApiJson(record): ApiJson<TelemetryRecord>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let stored = state
        .governor
        .ingest
        .ingest_one(record, &internal.correlation_id)
        .await
        .map_err(|error| internal.fail(error))?;

    info!(
        event_name = "ingest.record.accepted",
        id = stored.id,
        correlation_id = %internal.correlation_id,
        "telemetry record accepted"
    );
    Ok((StatusCode::CREATED, Json(IngestResponse { success: true, id: stored.id })))
}

async fn ingest_bulk(
    internal: Internal,
    State(state): State<AppState>,
    ApiJson(request): ApiJson<BulkRequest>,
) -> (StatusCode, Json<BulkResponse>) {
    let report = state.governor.ingest.ingest_batch(request.logs, &internal.correlation_id).await;
    (
        StatusCode::CREATED,
        Json(BulkResponse { success: true, inserted: report.inserted, skipped: report.skipped }),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::api::testing::{app, send};

    #[tokio::test]
    async fn single_record_returns_created_with_id() {
        let (router, state, _alerts) = app().await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/internal/logs",
            Some(json!({
                "request_id": "req_http_1",
                "model": "gpt-4o-mini",
                "prompt_tokens": 100,
                "completion_tokens": 20,
                "cost_usd": 0.0125,
                "latency_ms": 640
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert!(body["id"].as_i64().expect("id") > 0);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_log")
            .fetch_one(&state.db_pool)
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn malformed_single_record_is_unprocessable() {
        let (router, _state, _alerts) = app().await;

        let (status, body) =
            send(&router, Method::POST, "/internal/logs", Some(json!({"request_id": "req_x"}))).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().expect("error").contains("model"));
    }

    #[tokio::test]
    async fn bulk_reports_partial_success() {
        let (router, _state, _alerts) = app().await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/internal/logs/bulk",
            Some(json!({"logs": [
                {"request_id": "req_b1", "model": "gpt-4o"},
                {"request_id": "req_b2"},
                {"request_id": "req_b3", "model": "gpt-4o", "cost_usd": "0.5"}
            ]})),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({"success": true, "inserted": 2, "skipped": 1}));
    }

    #[tokio::test]
    async fn bulk_without_logs_array_is_unprocessable() {
        let (router, _state, _alerts) = app().await;

        let (status, _body) =
            send(&router, Method::POST, "/internal/logs/bulk", Some(json!({"records": []}))).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
