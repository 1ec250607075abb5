//! Pairing endpoint: exposes the latest QR payload and pairing code over HTTP
//! and serves a static directory for everything else.

use std::net::SocketAddr;
use std::path::Path;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::state::GatewayState;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Build the router. Unknown paths fall through to `static_dir`.
pub fn router(state: GatewayState, static_dir: &Path) -> Router {
    Router::new()
        .route("/qr", get(handle_qr))
        .route("/paircode", get(handle_paircode))
        .route("/status", get(handle_status))
        .with_state(state)
        .fallback_service(ServeDir::new(static_dir))
}

/// Bind `addr` and serve until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    cancel: CancellationToken,
) -> Result<(), HttpError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| HttpError::Bind { addr, source })?;
    log::info!("pairing endpoint listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// GET /qr
async fn handle_qr(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(serde_json::json!({ "qr": state.qr() }))
}

/// GET /paircode
async fn handle_paircode(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(serde_json::json!({ "code": state.pairing_code() }))
}

/// GET /status
async fn handle_status(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_qr_null_until_generated() {
        let dir = tempfile::tempdir().unwrap();
        let state = GatewayState::new();
        let app = router(state.clone(), dir.path());

        let (status, body) = get_json(app.clone(), "/qr").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "qr": null }));

        state.set_qr("2@first");
        state.set_qr("2@latest");
        let (_, body) = get_json(app, "/qr").await;
        assert_eq!(body["qr"], "2@latest");
    }

    #[tokio::test]
    async fn test_paircode_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = GatewayState::new();
        let app = router(state.clone(), dir.path());

        let (_, body) = get_json(app.clone(), "/paircode").await;
        assert_eq!(body["code"], Value::Null);

        state.set_pairing_code("ABCD-1234");
        let (_, body) = get_json(app.clone(), "/paircode").await;
        assert_eq!(body["code"], "ABCD-1234");

        state.set_connection(ConnectionState::Open);
        let (_, body) = get_json(app, "/status").await;
        assert_eq!(body["connection"], "open");
        assert_eq!(body["pairing_code"], Value::Null);
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>pair</h1>").unwrap();
        let app = router(GatewayState::new(), dir.path());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"<h1>pair</h1>");

        let response = app
            .oneshot(Request::builder().uri("/missing.css").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
