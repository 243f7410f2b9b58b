//! API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::ApiServerConfig;
use crate::error::{Result, RotatorError};
use crate::haproxy::ReverseProxy;
use crate::ports::PortAllocator;
use crate::rotation::{shutdown_requested, Scheduler};

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<ReverseProxy>,
    pub scheduler: Arc<Scheduler>,
    pub ports: Arc<PortAllocator>,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        proxy: Arc<ReverseProxy>,
        scheduler: Arc<Scheduler>,
        ports: Arc<PortAllocator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            proxy,
            scheduler,
            ports,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            shutdown,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router
    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until shutdown is requested
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| RotatorError::InvalidConfig(format!("API address: {}", e)))?;

        let router = self.build_router();

        info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_requested(&mut shutdown).await;
            })
            .await
            .map_err(|e| RotatorError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
