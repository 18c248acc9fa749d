//! HTTP exposition of Prometheus metrics

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{error, info};

use crate::{ObservabilityError, metrics::PrometheusMetrics};

const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Router serving `GET /metrics` and `GET /health`
pub fn metrics_router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(|| async { "ok" }))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<PrometheusMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE_TEXT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve metrics on `addr` until `shutdown` completes
///
/// # Errors
///
/// Returns [`ObservabilityError::Exporter`] if the address cannot be bound or
/// the server fails.
pub async fn serve_metrics<F>(
    addr: SocketAddr,
    metrics: Arc<PrometheusMetrics>,
    shutdown: F,
) -> Result<(), ObservabilityError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ObservabilityError::Exporter(format!("bind {addr}: {e}")))?;

    info!(%addr, "Serving Prometheus metrics");

    axum::serve(listener, metrics_router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ObservabilityError::Exporter(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsSink, OutcomeEvent, OutcomeStatus};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint_renders_registry() {
        let metrics = Arc::new(PrometheusMetrics::new("agent-1").unwrap());
        metrics.record_outcome(&OutcomeEvent {
            message_id: "1-0".into(),
            sender: "svc-a".into(),
            status: OutcomeStatus::Success,
            provider: "openai".into(),
            attempts: 1,
            retryable: false,
            error_code: None,
            duration: Duration::from_millis(40),
        });

        let response = metrics_router(metrics)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("beast_prompt_events_total"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let metrics = Arc::new(PrometheusMetrics::new("agent-1").unwrap());
        let response = metrics_router(metrics)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let metrics = Arc::new(PrometheusMetrics::new("agent-1").unwrap());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let result = serve_metrics(addr, metrics, async {}).await;
        assert!(result.is_ok());
    }
}
