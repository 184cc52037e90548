//! WebSocket connection handler
//!
//! One task per connection reads client frames; every search runs in its own
//! task and writes through a shared outgoing channel, so results for several
//! requests on the same socket interleave freely (each frame carries its `id`).

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::error::SearcherError;
use crate::service::{ArchiveSearchRequest, SearchService};
use crate::socket_server::protocol::{ClientMessage, ServerMessage};

/// Frames queued for the writer before searches start waiting on it
const OUTGOING_CAPACITY: usize = 256;

/// Handle a single WebSocket connection
///
/// `drain` stops the connection from reading new requests while letting
/// running ones finish; `abort` cancels running requests.
pub async fn handle_connection(
    stream: TcpStream,
    service: SearchService,
    drain: CancellationToken,
    abort: CancellationToken,
) {
    let addr = stream.peer_addr().ok();
    tracing::debug!("New connection from {:?}", addr);

    // Accept WebSocket handshake
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut sink, mut frames) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTGOING_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("WebSocket write failed: {}", e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = ConnectionState {
        service,
        out: out_tx,
        cancel: abort.child_token(),
        active: HashMap::new(),
        requests: JoinSet::new(),
    };

    let client_left = loop {
        tokio::select! {
            frame = frames.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => conn.handle_message(&text).await,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = conn.out.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break true,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break true;
                    }
                    _ => {}
                }
            }

            Some(joined) = conn.requests.join_next(), if !conn.requests.is_empty() => {
                conn.finished(joined);
            }

            _ = drain.cancelled() => break false,
        }
    };

    if client_left {
        // Nobody is listening for the results anymore.
        conn.cancel.cancel();
    }
    while let Some(joined) = conn.requests.join_next().await {
        conn.finished(joined);
    }

    drop(conn);
    let _ = writer.await;
    tracing::debug!("Connection closed from {:?}", addr);
}

/// State for a single connection
struct ConnectionState {
    service: SearchService,
    out: mpsc::Sender<Message>,
    /// Parent of every request token on this connection
    cancel: CancellationToken,
    active: HashMap<u64, CancellationToken>,
    requests: JoinSet<u64>,
}

impl ConnectionState {
    async fn handle_message(&mut self, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                let err = SearcherError::invalid_request(format!("malformed message: {}", e));
                self.send(&ServerMessage::error(None, &err)).await;
                return;
            }
        };

        match msg {
            ClientMessage::Search { id, request } => {
                if self.active.contains_key(&id) {
                    let err = SearcherError::invalid_request(format!(
                        "request id {} is already running",
                        id
                    ));
                    self.send(&ServerMessage::error(Some(id), &err)).await;
                    return;
                }
                let token = self.cancel.child_token();
                self.active.insert(id, token.clone());
                self.requests.spawn(run_search(
                    self.service.clone(),
                    id,
                    request,
                    token,
                    self.out.clone(),
                ));
            }

            ClientMessage::Cancel { id } => {
                if let Some(token) = self.active.get(&id) {
                    tracing::debug!(id, "client canceled request");
                    token.cancel();
                }
            }

            ClientMessage::Ping => {
                self.send(&ServerMessage::Pong).await;
            }
        }
    }

    fn finished(&mut self, joined: Result<u64, tokio::task::JoinError>) {
        match joined {
            Ok(id) => {
                self.active.remove(&id);
            }
            Err(e) => tracing::error!("Search task failed: {}", e),
        }
    }

    async fn send(&self, msg: &ServerMessage) {
        if let Some(frame) = encode(msg) {
            let _ = self.out.send(frame).await;
        }
    }
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::error!("Failed to encode server message: {}", e);
            None
        }
    }
}

/// Run one search and stream its frames; returns the request id.
async fn run_search(
    service: SearchService,
    id: u64,
    request: ArchiveSearchRequest,
    cancel: CancellationToken,
    out: mpsc::Sender<Message>,
) -> u64 {
    let mut response = match service.search(request, &cancel).await {
        Ok(response) => response,
        Err(err) => {
            if let Some(frame) = encode(&ServerMessage::from_failure(id, &err)) {
                let _ = out.send(frame).await;
            }
            return id;
        }
    };

    while let Some(file_match) = response.next().await {
        let Some(frame) = encode(&ServerMessage::file_match(id, file_match)) else {
            continue;
        };
        if out.send(frame).await.is_err() {
            // Writer is gone; dropping the response releases the archive.
            return id;
        }
    }

    let last = match response.summary() {
        Ok(summary) => ServerMessage::Done { id, summary },
        Err(err) => ServerMessage::error(Some(id), &err),
    };
    if let Some(frame) = encode(&last) {
        let _ = out.send(frame).await;
    }
    id
}
