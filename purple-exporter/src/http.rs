//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::registry::SharedRegistry;

/// Content type of the text exposition format.
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct ExporterState {
    registry: SharedRegistry,
    metrics_path: Arc<str>,
}

fn create_router(registry: SharedRegistry, metrics_path: &str) -> Router {
    let state = ExporterState {
        registry,
        metrics_path: metrics_path.into(),
    };

    Router::new()
        .route("/", get(index))
        .route(metrics_path, get(render_metrics))
        .route("/health", get(|| async { "healthy\n" }))
        .route("/ready", get(readiness))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn render_metrics(State(state): State<ExporterState>) -> Response {
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        state.registry.render(),
    )
        .into_response()
}

async fn index(State(state): State<ExporterState>) -> Html<String> {
    Html(format!(
        "<html><head><title>PurpleAir Exporter</title></head><body>\
         <h1>PurpleAir Exporter</h1><p><a href=\"{0}\">{0}</a></p></body></html>",
        state.metrics_path
    ))
}

/// Ready once the first scrape cycle has finished, whatever its outcome.
async fn readiness(State(state): State<ExporterState>) -> (StatusCode, &'static str) {
    if state.registry.stats().cycles_completed == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "waiting for first scrape cycle\n")
    } else {
        (StatusCode::OK, "ready\n")
    }
}

/// HTTP server with its listener already bound.
pub struct HttpServer {
    registry: SharedRegistry,
    listener: TcpListener,
    metrics_path: String,
}

impl HttpServer {
    /// Bind the listen address.
    ///
    /// Failing to bind is fatal for the exporter, so this happens before any
    /// scraping starts.
    pub async fn bind(
        registry: SharedRegistry,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", listen_addr))?;

        Ok(Self {
            registry,
            listener,
            metrics_path,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local address")
    }

    /// Serve until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        let router = create_router(self.registry, &self.metrics_path);

        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                debug!("HTTP server draining connections");
            })
            .await
            .context("HTTP server failed")?;

        info!(addr = %addr, "HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{self, register_metrics};
    use crate::registry::MetricsRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_registry() -> SharedRegistry {
        let registry = Arc::new(MetricsRegistry::new(""));
        register_metrics(&registry, "").unwrap();
        registry
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let registry = make_registry();
        registry.set_gauge(mapping::TEMP_F, &["abc123"], 72.5).unwrap();

        let (status, content_type, body) = get(create_router(registry, "/metrics"), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(EXPOSITION_CONTENT_TYPE));
        assert!(body.contains("# TYPE temp_f gauge"));
        assert!(body.contains("temp_f{host=\"abc123\"} 72.5"));
    }

    #[tokio::test]
    async fn test_health_and_index() {
        let router = create_router(make_registry(), "/metrics");

        let (status, _, body) = get(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "healthy\n");

        let (status, _, body) = get(router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("href=\"/metrics\""));
    }

    #[tokio::test]
    async fn test_readiness_follows_first_cycle() {
        let registry = make_registry();

        let (status, _, _) = get(create_router(registry.clone(), "/metrics"), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // A cycle where every sensor failed still counts.
        registry.record_cycle(0, 1);
        let (status, _, _) = get(create_router(registry, "/metrics"), "/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let router = create_router(make_registry(), "/purple/metrics");

        let (status, _, _) = get(router.clone(), "/purple/metrics").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = get(router, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = HttpServer::bind(make_registry(), addr, "/metrics".to_string())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to bind"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = HttpServer::bind(
            make_registry(),
            "127.0.0.1:0".parse().unwrap(),
            "/metrics".to_string(),
        )
        .await
        .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
