use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{Frame, Method, ServerEvent};
use super::SignalingChannel;
use crate::error::SignalingError;

const OUTGOING_QUEUE: usize = 100;
const EVENT_QUEUE: usize = 256;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// JSON-over-WebSocket signaling with id-correlated requests.
pub struct WsSignalingClient {
    outgoing: mpsc::Sender<Frame>,
    pending: Pending,
    events: broadcast::Sender<ServerEvent>,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl WsSignalingClient {
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        info!(%url, "signaling connected");

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Frame>(OUTGOING_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        let reader_pending = pending.clone();
        let reader_events = events.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        dispatch(&text, &reader_pending, &reader_events).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("signaling read failed: {}", e);
                        break;
                    }
                }
            }
            shut(&reader_closed, &reader_pending).await;
            info!("signaling channel closed");
        });

        Ok(Self {
            outgoing,
            pending,
            events,
            next_id: AtomicU64::new(1),
            request_timeout,
            closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Track a request unless the reader has already shut the channel.
async fn register(
    closed: &AtomicBool,
    pending: &Pending,
    id: u64,
    tx: oneshot::Sender<Value>,
) -> Result<(), SignalingError> {
    // Checked under the lock `shut` clears, so no entry outlives the reader.
    let mut pending = pending.lock().await;
    if closed.load(Ordering::SeqCst) {
        return Err(SignalingError::Closed);
    }
    pending.insert(id, tx);
    Ok(())
}

async fn shut(closed: &AtomicBool, pending: &Pending) {
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every in-flight request.
    pending.lock().await.clear();
}

async fn dispatch(text: &str, pending: &Pending, events: &broadcast::Sender<ServerEvent>) {
    let frame = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("ignoring malformed signaling frame: {}", e);
            return;
        }
    };
    match frame {
        Frame::Response { id, data } => match pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => debug!(id, "response for unknown or expired request"),
        },
        Frame::Event { event, data } => match ServerEvent::decode(&event, data) {
            Ok(Some(event)) => {
                // No subscribers simply means nobody is in a room yet.
                let _ = events.send(event);
            }
            Ok(None) => debug!(%event, "unhandled server event"),
            Err(e) => warn!(%event, "malformed server event: {}", e),
        },
        Frame::Request { method, .. } => debug!(%method, "ignoring server-initiated request"),
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingClient {
    async fn request(&self, method: Method, data: Value) -> Result<Value, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        register(&self.closed, &self.pending, id, tx).await?;

        if self
            .outgoing
            .send(Frame::Request { id, method, data })
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(SignalingError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SignalingError::Timeout {
                    method: method.to_string(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}
