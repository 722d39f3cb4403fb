//! Redial scheduling
//!
//! The dial queue maps a peer identity to the earliest time a new dial may
//! be attempted. A single sweep task owned by the node drains it; producers
//! insert peers and wake the sweeper instead of running their own loops.

use crate::network::peers::PeerHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// A dial queue entry
#[derive(Clone)]
pub struct QueuedPeer {
    pub peer: Arc<dyn PeerHandle>,
    pub next_dial: Instant,
}

/// Peer identity → next eligible dial time
pub struct DialQueue {
    entries: Mutex<HashMap<String, QueuedPeer>>,
    wake: Notify,
    backoff: Duration,
}

impl DialQueue {
    pub fn new(backoff: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            backoff,
        }
    }

    /// Queue `peer` for an immediate dial unless it is already queued.
    ///
    /// Returns true when a new entry was created. Either way the sweeper is
    /// woken.
    pub async fn insert(&self, peer: Arc<dyn PeerHandle>, now: Instant) -> bool {
        let inserted = {
            let mut entries = self.entries.lock().await;
            let id = peer.get_id();
            if entries.contains_key(&id) {
                false
            } else {
                entries.insert(
                    id,
                    QueuedPeer {
                        peer,
                        next_dial: now,
                    },
                );
                true
            }
        };
        self.wake.notify_one();
        inserted
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn next_dial(&self, id: &str) -> Option<Instant> {
        self.entries.lock().await.get(id).map(|e| e.next_dial)
    }

    /// Resolves when a producer asked for an early sweep
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    /// Entries whose next dial time has come
    pub async fn due(&self, now: Instant) -> Vec<Arc<dyn PeerHandle>> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.next_dial <= now)
            .map(|e| e.peer.clone())
            .collect()
    }

    /// Push the next dial of `id` one backoff past `now` (or past its
    /// current schedule, whichever is later)
    pub async fn reschedule(&self, id: &str, now: Instant) -> Option<Instant> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id)?;
        entry.next_dial = entry.next_dial.max(now) + self.backoff;
        Some(entry.next_dial)
    }

    /// Select the peers a sweep at `now` should dial.
    ///
    /// Due peers that are already active, or whose activity check fails, are
    /// left alone until the next sweep. Every selected peer is rescheduled
    /// before it is returned, so a failed dial still waits out the backoff.
    pub async fn take_dialable(&self, now: Instant) -> Vec<Arc<dyn PeerHandle>> {
        let mut dialable = Vec::new();

        for peer in self.due(now).await {
            match peer.is_active().await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    log::debug!("Skipping dial of {}: {}", peer.get_id(), e);
                    continue;
                }
            }

            if self.reschedule(&peer.get_id(), now).await.is_some() {
                dialable.push(peer);
            }
        }

        dialable
    }
}
