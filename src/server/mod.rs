//! The bridge gateway server.
//!
//! # Layout
//!
//! - [`registry`] - the connection registry and its indexes
//! - [`forward`] - forwarding coordinator for host-bound mutations
//! - [`gateway`] - protocol handling and the programmatic surface
//! - [`ws`] - WebSocket transport
//! - [`rest`] - REST facade under `/api/bridge`
//! - [`config`] - gateway configuration
//!
//! # Example
//!
//! ```ignore
//! use store_bridge::server::{serve, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> store_bridge::Result<()> {
//!     serve(GatewayConfig::from_env()?).await
//! }
//! ```

pub mod config;
pub mod forward;
pub mod gateway;
pub mod registry;
pub mod rest;
pub mod ws;

pub use config::GatewayConfig;
pub use forward::{ForwardCoordinator, ForwardRequest, InFlight};
pub use gateway::{Flow, Gateway};
pub use registry::{ConnectionHandle, ConnectionRegistry, HostConnection, PendingForward};

use crate::error::Result;
use crate::protocol::constants::REST_PREFIX;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the HTTP router for `gateway`: the WebSocket endpoint plus, when
/// enabled, the REST facade.
pub fn router(gateway: Gateway) -> Router {
    let config = gateway.config();
    let mut app = Router::new().route(&config.ws_path, get(ws::ws_handler));
    if config.enable_rest {
        app = app.nest(REST_PREFIX, rest::routes());
    }
    app.layer(TraceLayer::new_for_http()).with_state(gateway)
}

/// Bind `config.bind_addr` and spawn the gateway in the background.
///
/// Returns the bound address (useful with port 0) and a handle on the gateway.
pub async fn start(config: GatewayConfig) -> Result<(SocketAddr, Gateway)> {
    config.validate()?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    let gateway = Gateway::new(config);
    let app = router(gateway.clone());

    info!(%addr, ws_path = %gateway.config().ws_path, "bridge gateway listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("gateway server stopped: {}", e);
        }
    });
    Ok((addr, gateway))
}

/// Run the gateway until the process is interrupted.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    config.validate()?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    let ws_path = config.ws_path.clone();
    let app = router(Gateway::new(config));

    info!(%addr, %ws_path, "bridge gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
