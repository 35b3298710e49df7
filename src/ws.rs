use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, Stream, StreamExt},
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{HubError, HubResult};
use crate::protocol::Sample;
use crate::registry::{ConnectionId, PeerSink};
use crate::state::AppState;

/// WebSocket upgrade handler. Any origin is accepted.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let peer = connect_info.map(|Extension(ConnectInfo(addr))| addr);

    if state.is_shutting_down() {
        tracing::debug!("Rejecting upgrade from {:?}: shutting down", peer);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_failed_upgrade(move |e| {
        tracing::warn!("WebSocket upgrade failed for {:?}: {}", peer, e);
    })
    .on_upgrade(move |socket| handle_socket(socket, peer, state))
}

/// Write half of an upgraded socket
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PeerSink for WsSink {
    async fn send(&mut self, payload: &str) -> HubResult<()> {
        self.inner.send(Message::Text(payload.to_owned().into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        // Sends a Close frame; errors just mean the peer is already gone
        if let Err(e) = SinkExt::close(&mut self.inner).await {
            tracing::trace!("Close on dead socket: {}", e);
        }
    }
}

/// Counts a running reader for as long as it is alive
struct ReaderGuard(Arc<AtomicUsize>);

impl ReaderGuard {
    fn new(readers: Arc<AtomicUsize>) -> Self {
        readers.fetch_add(1, Ordering::SeqCst);
        Self(readers)
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serve one connection: register it, pump its samples into the dispatch
/// queue, and tear it down when reading stops or the connection is evicted.
async fn handle_socket(socket: WebSocket, peer: Option<SocketAddr>, state: Arc<AppState>) {
    let _reader = ReaderGuard::new(state.readers.clone());
    let (sender, receiver) = socket.split();
    let id = ConnectionId::new();

    let Some(mut evicted) = state.registry.register(id, Box::new(WsSink::new(sender))).await
    else {
        return;
    };

    tracing::info!(connection = %id, "Client connected from {:?}", peer);

    match read_loop(id, receiver, &state.queue, &mut evicted).await {
        HubError::PeerClosed => tracing::info!(connection = %id, "Client disconnected"),
        HubError::Evicted => tracing::info!(connection = %id, "Client evicted"),
        HubError::QueueClosed => tracing::info!(connection = %id, "Hub stopping, dropping client"),
        e => tracing::warn!(connection = %id, "Error reading sample: {}", e),
    }

    // Already gone if the dispatcher evicted it first
    if let Some(mut sink) = state.registry.unregister(id).await {
        sink.close().await;
    }
    // Dropping the read half here releases the socket
}

/// Decode samples from `stream` and enqueue them until reading fails or
/// `evicted` fires.
///
/// Returns why the loop ended. Enqueueing waits while the queue is full.
/// Frames still pending after an eviction are never enqueued.
pub async fn read_loop<S>(
    id: ConnectionId,
    mut stream: S,
    queue: &mpsc::Sender<Sample>,
    evicted: &mut oneshot::Receiver<()>,
) -> HubError
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut *evicted => return HubError::Evicted,
            frame = stream.next() => frame,
        };

        let decoded = match frame {
            Some(Ok(Message::Text(text))) => Sample::decode(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => Sample::decode(&bytes),
            Some(Ok(Message::Close(_))) | None => return HubError::PeerClosed,
            // Ping/pong are handled by the transport
            Some(Ok(_)) => continue,
            Some(Err(e)) => return e.into(),
        };

        let sample = match decoded {
            Ok(sample) => sample,
            Err(e) => return e,
        };

        tracing::debug!(connection = %id, "Received sample: {:?}", sample);

        let enqueued = tokio::select! {
            biased;
            _ = &mut *evicted => return HubError::Evicted,
            enqueued = queue.send(sample) => enqueued,
        };
        if enqueued.is_err() {
            return HubError::QueueClosed;
        }
    }
}
