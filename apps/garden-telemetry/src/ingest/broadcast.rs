use crate::telemetry::TelemetryRecord;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Subscriber {
    tx: mpsc::Sender<Arc<TelemetryRecord>>,
    site_filter: Option<String>,
}

impl Subscriber {
    fn wants(&self, site_id: &str) -> bool {
        self.site_filter
            .as_deref()
            .map_or(true, |filter| filter == site_id)
    }
}

/// Receiving end handed to one live consumer.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Arc<TelemetryRecord>>,
}

/// Fans each accepted update out to every registered consumer without waiting on any of them.
/// A consumer whose buffer is full or whose receiver is gone is dropped from the registry.
pub struct Broadcaster {
    subscribers: DashMap<Uuid, Subscriber>,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Registers a consumer with `initial` already queued ahead of any live update. The queue
    /// also holds `catch_up` extra records on top of the live buffer, for `deliver_to`.
    pub fn register(
        &self,
        site_filter: Option<String>,
        initial: Vec<Arc<TelemetryRecord>>,
        catch_up: usize,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer + initial.len() + catch_up);
        for record in initial {
            // Capacity covers the initial batch, so this cannot fail.
            let _ = tx.try_send(record);
        }
        let id = Uuid::new_v4();
        self.subscribers.insert(id, Subscriber { tx, site_filter });
        tracing::debug!(subscriber = %id, "live subscriber registered");
        Subscription { id, rx }
    }

    /// Returns how many consumers received the record.
    pub fn publish(&self, record: Arc<TelemetryRecord>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.wants(&record.site_id) {
                continue;
            }
            match entry.tx.try_send(record.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = %entry.key(),
                        "live subscriber lagging; dropping it"
                    );
                    dead.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        // Removal waits until iteration has released the shard guards.
        for id in dead {
            self.unsubscribe(&id);
        }
        delivered
    }

    /// Sends to one consumer only. Used to catch a fresh subscriber up, so a full queue skips
    /// the record instead of evicting; only a closed receiver removes the consumer.
    pub fn deliver_to(&self, id: &Uuid, record: Arc<TelemetryRecord>) -> bool {
        let result = match self.subscribers.get(id) {
            Some(entry) => {
                if !entry.wants(&record.site_id) {
                    return true;
                }
                entry.tx.try_send(record)
            }
            None => return false,
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = %id, "catch-up record skipped; subscriber queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unsubscribe(id);
                false
            }
        }
    }

    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, "live subscriber removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
}
