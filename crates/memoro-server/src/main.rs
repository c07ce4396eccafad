// Memoro Memory Protocol Server.
//
// Surface:
//   POST   /mcp                      — JSON-RPC 2.0 (memory_* methods)
//   GET    /ws                       — WebSocket event hub (version-gated)
//   POST   /cli/register             — push endpoint registration
//   DELETE /cli/register/:client_id  — push endpoint removal
//   GET    /health                   — liveness

mod routes;
mod state;
mod ws;

use axum::routing::{delete, get, post};
use axum::Router;
use log::info;
use memoro_core::config::Config;
use state::AppState;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::var("MEMORO_CONFIG").ok().map(std::path::PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    let listen = std::env::var("MEMORO_LISTEN").unwrap_or_else(|_| "127.0.0.1:7737".into());

    let app_state = AppState::build(&config)?;

    let app = Router::new()
        .route("/mcp", post(routes::mcp_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/cli/register", post(routes::register_push))
        .route("/cli/register/:client_id", delete(routes::deregister_push))
        .route("/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .with_state(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("[server] Memory Protocol Server listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state.clone()))
        .await?;

    info!("[server] Shut down cleanly");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("[server] Shutdown signal received — stopping background tasks");
    state.shutdown();
}
