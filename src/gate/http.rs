//! axum integration for the request gate.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::driver::Driver;
use crate::error::Error;

use super::{RequestGate, UNAVAILABLE_MESSAGE};

/// JSON body of a rejected request.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionBody {
    /// Always `false`.
    pub success: bool,
    /// Error category.
    pub error: &'static str,
    /// Human-readable explanation.
    pub message: String,
}

/// A `503 Service Unavailable` response.
#[derive(Debug, Clone)]
pub struct GateRejection {
    message: String,
}

impl GateRejection {
    /// Rejection carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<Error> for GateRejection {
    fn from(err: Error) -> Self {
        match err {
            Error::ServiceUnavailable(message) => Self::new(message),
            _ => Self::new(UNAVAILABLE_MESSAGE),
        }
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            success: false,
            error: "Service Unavailable",
            message: self.message,
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

/// Middleware running [`RequestGate::check`] before the downstream handler.
///
/// ```no_run
/// use axum::{middleware, routing::get, Router};
/// use docdb_guard::connection::ConnectionManager;
/// use docdb_guard::config::ConnectionConfig;
/// use docdb_guard::driver::TcpProbeDriver;
/// use docdb_guard::gate::{ensure_connection, RequestGate};
///
/// let manager = ConnectionManager::new(
///     TcpProbeDriver::new(),
///     ConnectionConfig::new("mongodb://127.0.0.1:27017/app"),
/// );
/// let gate = RequestGate::fast_reject(manager);
///
/// let app: Router = Router::new()
///     .route("/items", get(|| async { "[]" }))
///     .layer(middleware::from_fn_with_state(gate, ensure_connection::<TcpProbeDriver>));
/// ```
pub async fn ensure_connection<D: Driver>(
    State(gate): State<RequestGate<D>>,
    request: Request,
    next: Next,
) -> Response {
    match gate.check().await {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!(
                method = %request.method(),
                path = %request.uri().path(),
                error = %e,
                "request rejected"
            );
            GateRejection::from(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use axum::body::Body;
    use axum::middleware;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;
    use crate::config::GateMode;
    use crate::connection::ConnectionManager;
    use crate::testing::{test_config, ScriptedDriver};

    fn app(gate: RequestGate<ScriptedDriver>, hit: &Arc<AtomicBool>) -> Router {
        let handler = {
            let hit = Arc::clone(hit);
            move || {
                let hit = Arc::clone(&hit);
                async move {
                    hit.store(true, Ordering::SeqCst);
                    "ok"
                }
            }
        };

        Router::new()
            .route("/items", get(handler))
            .layer(middleware::from_fn_with_state(
                gate,
                ensure_connection::<ScriptedDriver>,
            ))
    }

    fn request() -> Request {
        axum::http::Request::builder()
            .uri("/items")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_with_503_json() {
        let driver = ScriptedDriver::succeeding();
        let gate = RequestGate::fast_reject(ConnectionManager::new(driver, test_config()));
        let hit = Arc::new(AtomicBool::new(false));

        let response = app(gate, &hit).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Service Unavailable");
        assert!(!body["message"].as_str().unwrap().is_empty());
        assert!(!hit.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_through_when_connected() {
        let driver = ScriptedDriver::succeeding();
        let manager = ConnectionManager::new(driver, test_config());
        manager.ensure_connected().await.unwrap();
        let hit = Arc::new(AtomicBool::new(false));

        let response = app(RequestGate::fast_reject(manager), &hit)
            .oneshot(request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(hit.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_mode_reaches_handler() {
        let driver = ScriptedDriver::new([false, false], true);
        let config = test_config().with_auto_reconnect(false);
        let gate = RequestGate::new(ConnectionManager::new(driver.clone(), config), GateMode::retry());
        let hit = Arc::new(AtomicBool::new(false));

        let response = app(gate, &hit).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(driver.connect_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_mode_uses_same_body() {
        let driver = ScriptedDriver::failing();
        let config = test_config().with_auto_reconnect(false);
        let gate = RequestGate::new(ConnectionManager::new(driver, config), GateMode::retry());
        let hit = Arc::new(AtomicBool::new(false));

        let response = app(gate, &hit).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Service Unavailable");
        assert_eq!(body["message"], UNAVAILABLE_MESSAGE);
        assert!(!hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_rejection_from_any_error() {
        let rejection = GateRejection::from(Error::Shutdown);
        assert_eq!(rejection.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
