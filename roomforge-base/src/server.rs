//! The standardized HTTP failure surface.
//!
//! Every non-2xx response leaving an agent is shaped as
//! `{ "error": { code, message, timestamp, path, details? } }`. Handlers
//! return [`ApiError`]; [`envelope_middleware`] stamps the request path in
//! and wraps any failure that escaped without an envelope (extractor
//! rejections, unmatched routes, wrong methods).

use axum::body::to_bytes;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use roomforge_core::RuntimeError;

/// Conceptual failure classes, each mapped onto one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User input rejected.
    Validation,
    /// Upload rejected by the static analyzer.
    SecurityRejection,
    /// Unknown instance or server.
    NotFound,
    /// Matchmaker entry exists but is stale.
    Gone,
    /// Wrong method on a known path.
    MethodNotAllowed,
    /// Capacity ceiling reached.
    AdmissionRefused,
    /// Container runtime operation failed.
    RuntimeFailure,
    /// A dependency this operation needs is unreachable.
    DependencyUnavailable,
    /// Anything unexpected.
    Internal,
}

impl ErrorKind {
    /// The HTTP status this kind maps to.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation | ErrorKind::SecurityRejection => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Gone => StatusCode::GONE,
            ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::AdmissionRefused | ErrorKind::DependencyUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::RuntimeFailure | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A failure on its way to becoming an error envelope.
#[derive(Debug, Clone)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    /// A failure of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Rejected user input.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Upload rejected by analysis; `details` should carry the findings.
    pub fn security_rejection(message: impl Into<String>, details: Value) -> Self {
        Self::new(ErrorKind::SecurityRejection, message).with_details(details)
    }

    /// Unknown instance or server.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Present but stale.
    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Gone, message)
    }

    /// Capacity ceiling reached.
    pub fn admission_refused(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AdmissionRefused, message)
    }

    /// Container runtime operation failed.
    pub fn runtime_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeFailure, message)
    }

    /// A required dependency is unreachable.
    pub fn dependency_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DependencyUnavailable, message)
    }

    /// Unexpected failure with a caller-chosen message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Unexpected failure; detailed in debug mode, generic otherwise.
    pub fn internal_from(err: impl std::fmt::Display, debug: bool) -> Self {
        if debug {
            Self::internal(err.to_string())
        } else {
            Self::internal("internal server error")
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The failure class.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The user-facing message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.status())
    }
}

impl std::error::Error for ApiError {}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match &err {
            RuntimeError::NotFound(_) => ApiError::not_found(err.to_string()),
            RuntimeError::Unavailable(_) => ApiError::dependency_unavailable(err.to_string()),
            _ => ApiError::runtime_failure(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorEnvelope::shape(status, &self.message, "", self.details.clone());
        let mut response = (status, Json(body)).into_response();
        // Stashed so the envelope layer can re-stamp the request path.
        response.extensions_mut().insert(self);
        response
    }
}

/// The single wrapper shape used for every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error payload.
    pub error: ErrorBody,
}

/// Contents of an [`ErrorEnvelope`].
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// HTTP status code, repeated in the body.
    pub code: u16,
    /// Human-readable description.
    pub message: String,
    /// ISO-8601 time the error was produced.
    pub timestamp: String,
    /// Request path that failed.
    pub path: String,
    /// Structured extras (e.g. security findings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    fn shape(status: StatusCode, message: &str, path: &str, details: Option<Value>) -> Self {
        Self {
            error: ErrorBody {
                code: status.as_u16(),
                message: message.to_owned(),
                timestamp: Utc::now().to_rfc3339(),
                path: path.to_owned(),
                details,
            },
        }
    }
}

const SALVAGE_BODY_LIMIT: usize = 64 * 1024;

/// Response layer guaranteeing the envelope shape on every failure.
pub async fn envelope_middleware(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_owned();
    let response = next.run(req).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    if let Some(err) = response.extensions().get::<ApiError>().cloned() {
        let message = err.message().to_owned();
        let body = ErrorEnvelope::shape(status, &message, &path, err.details);
        return (status, Json(body)).into_response();
    }

    // The failure escaped without an envelope; salvage whatever message the
    // original body carried.
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, SALVAGE_BODY_LIMIT).await.unwrap_or_default();
    let message = match std::str::from_utf8(&bytes) {
        Ok(text) if !text.trim().is_empty() => text.trim().to_owned(),
        _ => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_owned(),
    };
    let body = ErrorEnvelope::shape(status, &message, &path, None);
    (parts.status, Json(body)).into_response()
}

/// Bind and run an HTTP server until a shutdown signal arrives, letting
/// in-flight requests drain.
pub async fn serve(addr: std::net::SocketAddr, router: axum::Router) -> eyre::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use axum::middleware;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    async fn failing() -> Result<Json<Value>, ApiError> {
        Err(ApiError::not_found("server does not exist"))
    }

    fn app() -> Router {
        Router::new()
            .route("/missing", get(failing))
            .layer(middleware::from_fn(envelope_middleware))
    }

    #[tokio::test]
    async fn handler_errors_become_envelopes_with_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app()).await.unwrap() });

        let response = reqwest::get(format!("http://{addr}/missing")).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let envelope: ErrorEnvelope = response.json().await.unwrap();
        assert_eq!(envelope.error.code, 404);
        assert_eq!(envelope.error.path, "/missing");
        assert_eq!(envelope.error.message, "server does not exist");
        assert!(!envelope.error.timestamp.is_empty());
    }

    #[tokio::test]
    async fn stray_failures_are_wrapped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app()).await.unwrap() });

        // No such route: axum produces a bare 404 that the layer wraps.
        let response = reqwest::get(format!("http://{addr}/nope")).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let envelope: ErrorEnvelope = response.json().await.unwrap();
        assert_eq!(envelope.error.code, 404);
        assert_eq!(envelope.error.path, "/nope");

        // Wrong method on a known path: 405, also wrapped.
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/missing"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 405);
        let envelope: ErrorEnvelope = response.json().await.unwrap();
        assert_eq!(envelope.error.code, 405);
    }
}
