pub mod boards;
pub mod error;
pub mod feed;

use std::path::Path;
use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    routing::{get, post},
};
use tower_http::services::ServeDir;

use crate::feed::FeedHub;
use crate::registry::BoardRegistry;
use crate::transport::Transport;

pub struct AppState<T: Transport> {
    pub registry: BoardRegistry<T>,
    pub feed: Arc<FeedHub>,
}

impl<T: Transport> AppState<T> {
    pub fn new(registry: BoardRegistry<T>, feed: Arc<FeedHub>) -> Self {
        Self { registry, feed }
    }
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            feed: Arc::clone(&self.feed),
        }
    }
}

impl<T: Transport> FromRef<AppState<T>> for Arc<FeedHub> {
    fn from_ref(state: &AppState<T>) -> Self {
        Arc::clone(&state.feed)
    }
}

async fn health() -> &'static str {
    "OK"
}

/// JSON API, the feed at `/feed`, and static files for everything else.
pub fn router<T: Transport>(state: AppState<T>, static_root: &Path) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/feed", get(feed::upgrade))
        .route("/api/boards", get(boards::list_boards::<T>))
        .route("/api/boards/{address}", get(boards::get_board::<T>))
        .route("/api/boards/{address}/light", post(boards::set_light::<T>))
        .fallback_service(ServeDir::new(static_root))
        .with_state(state)
}

/// The dedicated feed listener: every path upgrades.
pub fn feed_router(hub: Arc<FeedHub>) -> Router {
    Router::new()
        .route("/", get(feed::upgrade))
        .route("/{*path}", get(feed::upgrade))
        .with_state(hub)
}
