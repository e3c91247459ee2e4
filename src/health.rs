//! Liveness endpoint

use crate::error::Result;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Default port of the liveness endpoint
pub const DEFAULT_PORT: u16 = 3001;

/// Liveness response body
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
}

/// GET /ready
pub async fn ready() -> Json<ReadyResponse> {
    Json(ReadyResponse { status: "ok" })
}

/// Router serving the liveness endpoint
pub fn router() -> Router {
    Router::new().route("/ready", get(ready))
}

/// Serve the liveness endpoint until `shutdown` turns true
pub async fn serve(addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Liveness endpoint listening on http://{}/ready", listener.local_addr()?);

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_ready_returns_ok() {
        let response = router()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
