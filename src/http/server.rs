//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router for the management API and the channel
//! - Wire up middleware (request ID, tracing, request timeout)
//! - Serve with connect info so handlers see the caller's address
//! - Drain on shutdown

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::http::HeaderName;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin;
use crate::context::GuardContext;
use crate::http::request::X_REQUEST_ID;
use crate::http::websocket::channel_handler;
use crate::lifecycle::Shutdown;

/// Application state injected into handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub ctx: GuardContext,
    pub shutdown: Shutdown,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(ctx: GuardContext, shutdown: Shutdown) -> Self {
        Self {
            ctx,
            shutdown,
            started_at: Instant::now(),
        }
    }
}

/// Management API and channel server.
pub struct GuardServer {
    router: Router,
    state: AppState,
}

impl GuardServer {
    pub fn new(ctx: GuardContext, shutdown: Shutdown) -> Self {
        let state = AppState::new(ctx, shutdown);
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(state: AppState) -> Router {
        let request_timeout = Duration::from_secs(state.ctx.config.admin.request_timeout_secs);
        let request_id = HeaderName::from_static(X_REQUEST_ID);

        // The channel is long-lived, so it sits outside the request timeout.
        let api = admin::router(state.clone()).layer(TimeoutLayer::new(request_timeout));

        Router::new()
            .merge(api)
            .route("/channel", get(channel_handler))
            .with_state(state)
            .layer(PropagateRequestIdLayer::new(request_id.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
    }

    /// Router without connect info, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve on `listener` until the shutdown signal fires.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Management API listening");

        let shutdown = self.state.shutdown.clone();
        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("Management API stopped");
        Ok(())
    }
}
