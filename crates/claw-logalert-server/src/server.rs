//! Control-surface server.

use std::net::SocketAddr;
use std::sync::Arc;

use claw_logalert::{RuleSource, SchedulerManager};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;
use crate::state::ServerState;

/// HTTP server exposing health, metrics, reload and alert evidence.
#[derive(Debug, Clone)]
pub struct LogAlertServer {
    state: Arc<ServerState>,
}

impl LogAlertServer {
    /// Create a server over a running scheduler.
    #[must_use]
    pub fn new(scheduler: Arc<SchedulerManager>, source: Arc<RuleSource>) -> Self {
        Self {
            state: Arc::new(ServerState::new(scheduler, source)),
        }
    }

    /// Get the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Serve until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve_with_shutdown<F>(&self, addr: SocketAddr, shutdown: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;

        info!(addr = %addr, "control surface listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        info!("control surface shut down");
        Ok(())
    }

    /// Create the router without starting the server.
    pub fn router(&self) -> axum::Router {
        create_router(Arc::clone(&self.state))
    }
}
