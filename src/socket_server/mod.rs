//! Searcher Socket Server
//!
//! JSON-over-WebSocket transport in front of [`SearchService`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SEARCHER SOCKET SERVER                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  accept loop ──► connection task (one per client)                       │
//! │                    - reads frames                                       │
//! │                    - spawns one task per search, keyed by request id    │
//! │                    - writer task drains an mpsc of outgoing frames      │
//! │                                                                         │
//! │  search task ──► SearchService ──► ArchiveCache ──► SearchExecutor      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! ```json
//! // Client -> Server
//! {"type": "search", "id": 1, "repo": "r", "commit": "c1", "pattern": "world"}
//! {"type": "cancel", "id": 1}
//! {"type": "ping"}
//!
//! // Server -> Client
//! {"type": "file_match", "id": 1, "path": "a.txt", "line_matches": [...]}
//! {"type": "done", "id": 1, "summary": {"status": "completed", ...}}
//! {"type": "error", "id": 1, "code": "not_found", "status": 404, "message": "..."}
//! {"type": "pong"}
//! ```
//!
//! # Shutdown
//!
//! When the shutdown token fires the server stops accepting, connections stop
//! reading new requests, and in-flight requests get `grace` to finish before
//! they are canceled and abandoned.

pub mod connection;
pub mod protocol;

pub use connection::handle_connection;
pub use protocol::{ClientMessage, ServerMessage};

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::service::SearchService;

/// Time given to canceled requests to send their final frame
const ABORT_FLUSH: Duration = Duration::from_secs(1);

/// Accept connections until `shutdown` fires, then drain.
pub async fn serve(
    listener: TcpListener,
    service: SearchService,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let abort = CancellationToken::new();
    let mut connections = JoinSet::new();

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Searcher listening on ws://{}", addr);
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!("Accepted connection from {}", addr);
                        connections.spawn(handle_connection(
                            stream,
                            service.clone(),
                            shutdown.clone(),
                            abort.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                        // Usually fd exhaustion; back off instead of spinning.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Connection task failed: {}", e);
                }
            }

            _ = shutdown.cancelled() => break,
        }
    }

    drop(listener);
    tracing::info!(
        connections = connections.len(),
        grace_secs = grace.as_secs(),
        "Shutting down, draining in-flight requests"
    );

    if tokio::time::timeout(grace, drain(&mut connections)).await.is_err() {
        tracing::warn!(
            connections = connections.len(),
            "Grace period expired, canceling remaining requests"
        );
        abort.cancel();
        let _ = tokio::time::timeout(ABORT_FLUSH, drain(&mut connections)).await;
        connections.abort_all();
    }
    tracing::info!("Searcher stopped");
}

/// Cancel `shutdown` once `interrupt` resolves.
///
/// If the signal listener could not be installed the error is logged and the
/// server keeps running.
pub async fn shutdown_on<F>(interrupt: F, shutdown: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match interrupt.await {
        Ok(()) => {
            tracing::info!("Received interrupt");
            shutdown.cancel();
        }
        Err(e) => tracing::error!("Failed to listen for interrupt: {}", e),
    }
}

async fn drain(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}
