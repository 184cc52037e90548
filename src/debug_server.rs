//! Debug HTTP listener
//!
//! Serves `GET /healthz` and `GET /debug/cache` (cache statistics as JSON) on
//! the profiling address when one is configured.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::{ArchiveCache, CacheStats};

pub fn router(cache: ArchiveCache) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/cache", get(cache_stats))
        .with_state(cache)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn cache_stats(State(cache): State<ArchiveCache>) -> Json<CacheStats> {
    Json(cache.stats())
}

/// Serve until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    cache: ArchiveCache,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Debug listener on http://{}", addr);
    }
    axum::serve(listener, router(cache))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
