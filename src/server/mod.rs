//! HTTP surface for batch generation, previews and the image proxy.

mod handlers;
mod state;

pub use state::{AppState, ServerConfig};

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::foundation::error::PinforgeResult;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/pins/generate", post(handlers::generate))
        .route("/api/pins/preview", post(handlers::preview))
        .route("/api/proxy-image", get(handlers::proxy_image))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and block until it exits.
pub async fn serve(config: ServerConfig) -> PinforgeResult<()> {
    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState::new(config)?);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("bind to {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "pinforge server listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
