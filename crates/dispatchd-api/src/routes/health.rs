//! Health check endpoint. Deliberately independent of registry and cache
//! state.

use axum::Router;
use axum::routing::get;

pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}

async fn health() -> &'static str {
    "OK"
}
