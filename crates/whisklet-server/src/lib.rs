pub mod error;
pub mod routes;
pub mod state;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use state::AppState;

/// Build the axum Router: the diagnostics route plus a fallback that
/// dispatches everything else against the route table. Used by `serve()` and
/// available for integration testing.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/_routes", get(routes::diagnostics::list_routes))
        .fallback(routes::dispatch::dispatch)
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the action host on the given port.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let registered = state.table.len();
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("whisklet serving {registered} action(s) on http://localhost:{port}");

    axum::serve(listener, app).await?;
    Ok(())
}
