//! HTTP API
//!
//! Registration, login and conversation management over JSON. Real-time
//! delivery happens on the WebSocket relay; this API only reads and writes
//! the store.

mod error;
mod extract;
mod handlers;
mod routes;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub use error::{ApiError, ApiResult};
pub use extract::AuthUser;
pub use routes::create_router;

use crate::auth::AuthService;
use crate::config::Settings;
use crate::relay::Relay;
use crate::store::Store;

/// Shared state of the HTTP API
pub struct AppState {
    pub store: Store,
    pub auth: AuthService,
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(store: Store, auth: AuthService, relay: Arc<Relay>) -> Self {
        Self { store, auth, relay }
    }
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    settings: &Settings,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = settings.api_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP API listening on http://{}", addr);

    let app = create_router(state, settings.server.static_dir.as_deref());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
