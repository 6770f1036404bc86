//! Shared plumbing for the HTTP surface: state, the internal-secret guard,
//! JSON extraction and the error body.
//!
//! Every route except `/health` requires `X-Internal-Secret`. Errors are
//! returned as `{"error": "..."}`.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use runwarden_core::errors::{ApplicationError, InterfaceError};
use runwarden_core::secrets::constant_time_eq;
use runwarden_db::DbPool;
use runwarden_governor::Governor;
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

pub const SECRET_HEADER: &str = "x-internal-secret";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub governor: Governor,
    pub db_pool: DbPool,
    internal_secret: Arc<SecretString>,
}

impl AppState {
    pub fn new(governor: Governor, db_pool: DbPool, internal_secret: SecretString) -> Self {
        Self { governor, db_pool, internal_secret: Arc::new(internal_secret) }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(crate::health::routes())
        .merge(crate::ingest::routes())
        .merge(crate::runs::routes())
        .merge(crate::admin::routes())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// A failed request: the status and the message placed in the error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self { status: StatusCode::UNAUTHORIZED, message: "Unauthorized".to_string() }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self { status: StatusCode::UNPROCESSABLE_ENTITY, message: message.into() }
    }

    pub fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        let interface = error.into_interface(correlation_id);
        let (status, message) = match &interface {
            InterfaceError::BadRequest { message, .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, message.clone())
            }
            InterfaceError::Unauthorized { .. } => {
                (StatusCode::UNAUTHORIZED, interface.user_message().to_string())
            }
            InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, message.clone()),
            InterfaceError::Conflict { message, .. } => (StatusCode::CONFLICT, message.clone()),
            InterfaceError::ServiceUnavailable { message, .. } => {
                error!(
                    event_name = "api.request.unavailable",
                    correlation_id,
                    error = %message,
                    "request failed on a backing service"
                );
                (StatusCode::SERVICE_UNAVAILABLE, interface.user_message().to_string())
            }
            InterfaceError::Internal { message, .. } => {
                error!(
                    event_name = "api.request.internal",
                    correlation_id,
                    error = %message,
                    "request failed"
                );
                (StatusCode::INTERNAL_SERVER_ERROR, interface.user_message().to_string())
            }
        };
        Self { status, message }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Proof that the caller presented the internal secret, plus the request's
/// correlation id (taken from `X-Correlation-Id` or generated).
#[derive(Clone, Debug)]
pub struct Internal {
    pub correlation_id: String,
}

impl Internal {
    pub fn fail(&self, error: ApplicationError) -> ApiError {
        ApiError::from_application(error, &self.correlation_id)
    }
}

impl FromRequestParts<AppState> for Internal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let correlation_id = correlation_id(&parts.headers);
        let presented = parts
            .headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let expected = state.internal_secret.expose_secret();

        if presented.is_empty() || !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!(
                event_name = "api.auth.rejected",
                correlation_id = %correlation_id,
                path = %parts.uri.path(),
                "request without a valid internal secret"
            );
            return Err(ApiError::unauthorized());
        }
        Ok(Self { correlation_id })
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}

/// `Json` whose rejections use the error body and status 422.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(request, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    ApiError::unprocessable(rejection.body_text())
}
