//! Remote consumers keyed by (peer id, producer id).
//!
//! A key is reserved before the `consume` round-trip starts, so a second
//! request for the same producer (event and backfill racing, or a duplicated
//! event) is skipped instead of creating another receiver. Removing a key while
//! its consume is still in flight cancels that consume.

use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::engine::EngineConsumer;
use crate::error::ConsumeError;
use crate::media::TrackRef;
use crate::rtp::MediaKind;
use crate::signaling::Signaling;
use crate::sink::RenderSink;
use crate::transport::RecvTransportHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerKey {
    pub peer_id: String,
    pub producer_id: String,
}

impl ConsumerKey {
    pub fn new(peer_id: impl Into<String>, producer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            producer_id: producer_id.into(),
        }
    }
}

impl fmt::Display for ConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.peer_id, self.producer_id)
    }
}

/// Snapshot of an active consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub key: ConsumerKey,
    pub id: String,
    pub kind: MediaKind,
    pub track: TrackRef,
    pub paused: bool,
}

#[derive(Debug)]
pub enum ConsumeOutcome {
    Consumed(Consumer),
    /// The key was already active or in flight.
    Skipped,
}

enum Slot {
    Pending(u64),
    Active(Box<dyn EngineConsumer>),
}

pub struct ConsumerRegistry {
    slots: Mutex<HashMap<ConsumerKey, Slot>>,
    next_token: AtomicU64,
    sink: Arc<dyn RenderSink>,
}

impl ConsumerRegistry {
    pub fn new(sink: Arc<dyn RenderSink>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            sink,
        }
    }

    pub async fn consume(
        &self,
        recv: &RecvTransportHandle,
        signaling: &Signaling,
        device: &Device,
        peer_id: &str,
        producer_id: &str,
        kind: MediaKind,
    ) -> Result<ConsumeOutcome, ConsumeError> {
        let key = ConsumerKey::new(peer_id, producer_id);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        {
            let mut slots = self.slots.lock().await;
            if slots.contains_key(&key) {
                debug!(%key, "consumer already present or in flight");
                return Ok(ConsumeOutcome::Skipped);
            }
            slots.insert(key.clone(), Slot::Pending(token));
        }

        let consumer = match establish(recv, signaling, device, &key).await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.release(&key, token).await;
                return Err(e);
            }
        };
        if consumer.kind() != kind {
            warn!(%key, announced = %kind, actual = %consumer.kind(), "consumer kind differs from announcement");
        }

        let mut slots = self.slots.lock().await;
        let reserved = matches!(slots.get(&key), Some(Slot::Pending(t)) if *t == token);
        if !reserved {
            drop(slots);
            consumer.close().await;
            debug!(%key, "consume finished after its reservation was cleared");
            return Err(ConsumeError::Cancelled { key });
        }
        let snapshot = snapshot(&key, consumer.as_ref());
        slots.insert(key.clone(), Slot::Active(consumer));
        // Emitted under the lock so a racing removal is always reported after.
        self.sink.on_consumer_added(&key, snapshot.kind, &snapshot.track);
        drop(slots);

        info!(%key, consumer_id = %snapshot.id, kind = %snapshot.kind, "consumer added");
        Ok(ConsumeOutcome::Consumed(snapshot))
    }

    async fn release(&self, key: &ConsumerKey, token: u64) {
        let mut slots = self.slots.lock().await;
        if matches!(slots.get(key), Some(Slot::Pending(t)) if *t == token) {
            slots.remove(key);
        }
    }

    /// Close one consumer. A pending reservation is cancelled.
    pub async fn remove(&self, key: &ConsumerKey) -> bool {
        let removed = {
            let mut slots = self.slots.lock().await;
            match slots.remove(key) {
                Some(Slot::Active(consumer)) => {
                    self.sink.on_consumer_removed(key);
                    Some(consumer)
                }
                Some(Slot::Pending(_)) | None => None,
            }
        };
        match removed {
            Some(consumer) => {
                consumer.close().await;
                info!(%key, "consumer removed");
                true
            }
            None => false,
        }
    }

    /// Close `consumer` if its key still maps to the same consumer id.
    pub async fn remove_consumer(&self, consumer: &Consumer) -> bool {
        let removed = {
            let mut slots = self.slots.lock().await;
            let matches = matches!(
                slots.get(&consumer.key),
                Some(Slot::Active(active)) if active.id() == consumer.id
            );
            if !matches {
                return false;
            }
            match slots.remove(&consumer.key) {
                Some(Slot::Active(active)) => {
                    self.sink.on_consumer_removed(&consumer.key);
                    Some(active)
                }
                _ => None,
            }
        };
        match removed {
            Some(active) => {
                active.close().await;
                info!(key = %consumer.key, "consumer removed");
                true
            }
            None => false,
        }
    }

    /// Close every consumer belonging to `peer_id`.
    pub async fn remove_peer(&self, peer_id: &str) -> usize {
        let removed = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<ConsumerKey> = slots
                .keys()
                .filter(|key| key.peer_id == peer_id)
                .cloned()
                .collect();
            self.take(&mut slots, keys)
        };
        let count = removed.len();
        close_all(removed).await;
        if count > 0 {
            info!(%peer_id, count, "peer consumers removed");
        }
        count
    }

    pub async fn remove_all(&self) {
        let removed = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<ConsumerKey> = slots.keys().cloned().collect();
            self.take(&mut slots, keys)
        };
        let count = removed.len();
        close_all(removed).await;
        debug!(count, "all consumers removed");
    }

    fn take(
        &self,
        slots: &mut HashMap<ConsumerKey, Slot>,
        mut keys: Vec<ConsumerKey>,
    ) -> Vec<(ConsumerKey, Box<dyn EngineConsumer>)> {
        keys.sort();
        let mut removed = Vec::new();
        for key in keys {
            if let Some(Slot::Active(consumer)) = slots.remove(&key) {
                self.sink.on_consumer_removed(&key);
                removed.push((key, consumer));
            }
        }
        removed
    }

    /// Producer ids currently consumed from `peer_id`.
    pub async fn producers_of(&self, peer_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active_keys()
            .await
            .into_iter()
            .filter(|key| key.peer_id == peer_id)
            .map(|key| key.producer_id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn keys(&self) -> Vec<ConsumerKey> {
        self.active_keys().await
    }

    async fn active_keys(&self) -> Vec<ConsumerKey> {
        let slots = self.slots.lock().await;
        let mut keys: Vec<ConsumerKey> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn get(&self, key: &ConsumerKey) -> Option<Consumer> {
        match self.slots.lock().await.get(key) {
            Some(Slot::Active(consumer)) => Some(snapshot(key, consumer.as_ref())),
            _ => None,
        }
    }

    /// Active consumers ordered by key.
    pub async fn consumers(&self) -> Vec<Consumer> {
        let slots = self.slots.lock().await;
        let mut consumers: Vec<Consumer> = slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Active(consumer) => Some(snapshot(key, consumer.as_ref())),
                Slot::Pending(_) => None,
            })
            .collect();
        consumers.sort_by(|a, b| a.key.cmp(&b.key));
        consumers
    }

    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn establish(
    recv: &RecvTransportHandle,
    signaling: &Signaling,
    device: &Device,
    key: &ConsumerKey,
) -> Result<Box<dyn EngineConsumer>, ConsumeError> {
    let parameters = signaling
        .consume(recv.id(), &key.producer_id, device.rtp_capabilities())
        .await
        .map_err(|source| ConsumeError::Rejected {
            key: key.clone(),
            source,
        })?;
    let consumer = recv
        .consume(&parameters)
        .await
        .map_err(|source| ConsumeError::Engine {
            key: key.clone(),
            source,
        })?;
    if let Err(source) = consumer.resume().await {
        consumer.close().await;
        return Err(ConsumeError::Engine {
            key: key.clone(),
            source,
        });
    }
    Ok(consumer)
}

fn snapshot(key: &ConsumerKey, consumer: &dyn EngineConsumer) -> Consumer {
    Consumer {
        key: key.clone(),
        id: consumer.id().to_owned(),
        kind: consumer.kind(),
        track: consumer.track(),
        paused: consumer.is_paused(),
    }
}

async fn close_all(consumers: Vec<(ConsumerKey, Box<dyn EngineConsumer>)>) {
    join_all(consumers.iter().map(|(_, consumer)| consumer.close())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use std::collections::HashSet;

    #[test]
    fn key_display_joins_peer_and_producer() {
        let key = ConsumerKey::new("peer2", "p1");
        assert_eq!(key.to_string(), "peer2-p1");
    }

    #[test]
    fn keys_compare_on_both_parts() {
        let mut set = HashSet::new();
        assert!(set.insert(ConsumerKey::new("peer2", "p1")));
        assert!(!set.insert(ConsumerKey::new("peer2", "p1")));
        assert!(set.insert(ConsumerKey::new("peer3", "p1")));
        assert!(ConsumerKey::new("a", "z") < ConsumerKey::new("b", "a"));
    }

    #[tokio::test]
    async fn removals_on_empty_registry_emit_nothing() {
        let (sink, mut events) = ChannelSink::new();
        let registry = ConsumerRegistry::new(Arc::new(sink));
        assert!(!registry.remove(&ConsumerKey::new("peer2", "p1")).await);
        assert_eq!(registry.remove_peer("peer2").await, 0);
        registry.remove_all().await;
        assert!(registry.is_empty().await);
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty)
        ));
    }
}
