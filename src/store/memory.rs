//! In-memory event store
//!
//! Reference implementation of the storage contract backed by a `RwLock`'d
//! map keyed by envelope id. Intended for tests and single-process
//! embedding; durability is a concern for real backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::errors::RelayResult;
use crate::store::EventStore;

/// Map-backed event store
///
/// The write lock is held only for the map mutation itself, so a
/// `find_since` racing a `save` observes either the old or the new state,
/// never a torn one.
#[derive(Default)]
pub struct InMemoryEventStore {
    envelopes: RwLock<HashMap<Uuid, EventEnvelope>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes currently held
    pub async fn len(&self) -> usize {
        self.envelopes.read().await.len()
    }

    /// Whether the store holds no envelopes
    pub async fn is_empty(&self) -> bool {
        self.envelopes.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save(&self, envelope: EventEnvelope) -> RelayResult<()> {
        let mut envelopes = self.envelopes.write().await;
        envelopes.insert(envelope.id, envelope);
        Ok(())
    }

    async fn find_since(&self, since: DateTime<Utc>) -> RelayResult<Vec<EventEnvelope>> {
        let envelopes = self.envelopes.read().await;
        let mut matching: Vec<EventEnvelope> = envelopes
            .values()
            .filter(|e| e.created_at >= since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.cmp_by_order(b));
        Ok(matching)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> RelayResult<u64> {
        let mut envelopes = self.envelopes.write().await;
        let before = envelopes.len();
        envelopes.retain(|_, e| e.created_at >= cutoff);
        Ok((before - envelopes.len()) as u64)
    }
}
