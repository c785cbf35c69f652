mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{dispatcher::AlertDispatcher, Result};

pub use routes::{AlertResponse, HealthResponse, WebhookPayload, WebhookResponse};

pub struct Server {
    dispatcher: Arc<AlertDispatcher>,
}

impl Server {
    pub fn new(dispatcher: Arc<AlertDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/webhook", post(routes::webhook))
            .route("/metrics", get(routes::metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.dispatcher)
    }

    /// Serves until `shutdown` resolves, then lets open requests finish.
    pub async fn start<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Webhook server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Webhook server stopped");
        Ok(())
    }
}
