/// Optional HTTP API: /health, /stats, /metrics

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::metrics::prometheus as metrics;
use crate::registry::SessionRegistry;
use crate::stats::StatsAggregator;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
    pub aggregator: Arc<StatsAggregator>,
    pub start_time: i64,
}

impl ApiState {
    pub fn new(registry: Arc<SessionRegistry>, aggregator: Arc<StatsAggregator>) -> Self {
        Self {
            registry,
            aggregator,
            start_time: Utc::now().timestamp(),
        }
    }
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let template = state.registry.current_template().await;
    Json(json!({
        "status": "ok",
        "sessions": state.registry.count().await,
        "job": template.as_ref().map(|w| w.job_id()),
        "uptime_secs": Utc::now().timestamp().saturating_sub(state.start_time),
    }))
}

async fn api_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = state.aggregator.snapshot().await;
    Json(serde_json::to_value(snapshot).unwrap_or_else(|e| json!({"error": e.to_string()})))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/stats", get(api_stats))
        .route("/metrics", get(api_metrics))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("📡 Stats API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    #[tokio::test]
    async fn test_api_endpoints() {
        let registry = Arc::new(SessionRegistry::new(false, 8));
        let aggregator = Arc::new(StatsAggregator::new(Arc::clone(&registry), Mode::Pool, None));
        let state = ApiState::new(registry, aggregator);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));
        assert!(response.contains("\"sessions\":0"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
