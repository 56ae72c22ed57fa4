//! Local producers, at most one per role.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::{AppData, EngineProducer};
use crate::error::{Error, Result};
use crate::media::LocalTrack;
use crate::rtp::MediaKind;
use crate::transport::SendTransportHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerRole {
    Mic,
    Camera,
    Screen,
}

impl ProducerRole {
    pub fn kind(&self) -> MediaKind {
        match self {
            ProducerRole::Mic => MediaKind::Audio,
            ProducerRole::Camera | ProducerRole::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerRole::Mic => "mic",
            ProducerRole::Camera => "camera",
            ProducerRole::Screen => "screen",
        }
    }
}

impl fmt::Display for ProducerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a live producer.
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
    pub role: ProducerRole,
    pub kind: MediaKind,
    pub track: LocalTrack,
}

struct Entry {
    producer: Box<dyn EngineProducer>,
    track: LocalTrack,
    watcher: Option<JoinHandle<()>>,
}

impl Entry {
    fn snapshot(&self, role: ProducerRole) -> Producer {
        Producer {
            id: self.producer.id().to_owned(),
            role,
            kind: self.producer.kind(),
            track: self.track.clone(),
        }
    }

    async fn close(mut self, role: ProducerRole) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.producer.close().await;
        self.track.stop();
        info!(%role, producer_id = self.producer.id(), "producer closed");
    }
}

type Entries = Arc<Mutex<HashMap<ProducerRole, Entry>>>;

#[derive(Default)]
pub struct ProducerRegistry {
    // Held for the whole of add/remove so role replacement is serialized.
    entries: Entries,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce `track` for `role`, closing whatever held that role before.
    pub async fn add_local_producer(
        &self,
        transport: &SendTransportHandle,
        role: ProducerRole,
        track: LocalTrack,
    ) -> Result<Producer> {
        if track.kind() != role.kind() {
            return Err(Error::KindMismatch {
                role: role.to_string(),
                track: track.kind(),
            });
        }

        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.remove(&role) {
            debug!(%role, "replacing existing producer");
            previous.close(role).await;
        }

        let app_data = AppData {
            role,
            correlation_id: correlation_id(role),
        };
        let producer = transport.produce(track.clone(), app_data).await?;
        info!(
            %role,
            producer_id = producer.id(),
            track_id = track.id(),
            "producer created"
        );

        let watcher = match role {
            ProducerRole::Screen => Some(watch_track_end(
                Arc::downgrade(&self.entries),
                role,
                producer.id().to_owned(),
                track.clone(),
            )),
            _ => None,
        };
        let entry = Entry {
            producer,
            track,
            watcher,
        };
        let snapshot = entry.snapshot(role);
        entries.insert(role, entry);
        Ok(snapshot)
    }

    /// Close the producer for `role` and stop its track. Returns whether one existed.
    pub async fn remove_local_producer(&self, role: ProducerRole) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.remove(&role) {
            Some(entry) => {
                entry.close(role).await;
                true
            }
            None => false,
        }
    }

    pub async fn remove_all(&self) {
        let mut entries = self.entries.lock().await;
        let mut roles: Vec<ProducerRole> = entries.keys().copied().collect();
        roles.sort();
        for role in roles {
            if let Some(entry) = entries.remove(&role) {
                entry.close(role).await;
            }
        }
    }

    pub async fn get(&self, role: ProducerRole) -> Option<Producer> {
        self.entries
            .lock()
            .await
            .get(&role)
            .map(|entry| entry.snapshot(role))
    }

    /// Live producers ordered by role.
    pub async fn producers(&self) -> Vec<Producer> {
        let entries = self.entries.lock().await;
        let mut producers: Vec<Producer> = entries
            .iter()
            .map(|(role, entry)| entry.snapshot(*role))
            .collect();
        producers.sort_by_key(|p| p.role);
        producers
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn correlation_id(role: ProducerRole) -> String {
    format!("{}-{:016x}", role, rand::random::<u64>())
}

/// Drops the producer for `role` once its track ends at the source, as long as
/// it is still the producer identified by `producer_id`.
fn watch_track_end(
    entries: Weak<Mutex<HashMap<ProducerRole, Entry>>>,
    role: ProducerRole,
    producer_id: String,
    track: LocalTrack,
) -> JoinHandle<()> {
    let mut ended = track.ended();
    tokio::spawn(async move {
        while !*ended.borrow_and_update() {
            if ended.changed().await.is_err() {
                return;
            }
        }
        let Some(entries) = entries.upgrade() else {
            return;
        };
        let mut entries = entries.lock().await;
        let current = entries
            .get(&role)
            .map_or(false, |entry| entry.producer.id() == producer_id);
        if !current {
            return;
        }
        if let Some(mut entry) = entries.remove(&role) {
            info!(%role, %producer_id, "track ended, removing producer");
            // Detach rather than abort: this task is the watcher.
            entry.watcher.take();
            entry.close(role).await;
        }
    })
}
