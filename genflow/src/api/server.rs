//! API server setup.

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::artifacts::ArtifactService;
use crate::config::ApiServerConfig;
use crate::logging::LoggingConfig;
use crate::manager::TaskManager;
use crate::{Error, Result};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub manager: Arc<TaskManager>,
    pub artifacts: Arc<ArtifactService>,
    /// Present when the global subscriber was installed by this process.
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(manager: Arc<TaskManager>, artifacts: Arc<ArtifactService>) -> Self {
        Self {
            start_time: Instant::now(),
            manager,
            artifacts,
            logging_config: None,
        }
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

fn is_health_path(req: &Request) -> bool {
    let path = req.uri().path();
    path.starts_with("/health") || path == "/api/task-manager/health"
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Routes plus body limit, optional CORS and request tracing.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone())
            .layer(DefaultBodyLimit::max(self.config.body_limit));

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any);
            router = router.layer(cors);
        }

        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if is_health_path(req) {
                        return Span::none();
                    }
                    tracing::info_span!(
                        "http",
                        method = %req.method(),
                        path = %req.uri().path(),
                    )
                })
                .on_request(())
                .on_response(|res: &Response<Body>, latency: Duration, span: &Span| {
                    if !span.is_disabled() {
                        tracing::info!(
                            parent: span,
                            status = res.status().as_u16(),
                            latency_ms = latency.as_millis() as u64,
                            "request handled"
                        );
                    }
                }),
        )
    }

    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("bind address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "genflow API listening");

        let stopped = self.cancel_token.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move { stopped.cancelled().await })
            .await
            .map_err(|e| Error::Other(format!("API server: {e}")))
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
