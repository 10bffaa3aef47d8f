//! Storage contract for event envelopes
//!
//! This module defines the interface a durable backend must satisfy to hold
//! distributed events. The subsystem only consumes this contract; concrete
//! database adapters live outside, with [`memory::InMemoryEventStore`] as the
//! reference backend for tests and embedding.
//!
//! # Contract requirements
//!
//! 1. **Idempotent save**: `save` is an upsert keyed by envelope id, so a
//!    retried save never creates a duplicate
//! 2. **Ordered range reads**: `find_since` returns envelopes ascending by
//!    `(created_at, id)` so every reader resolves timestamp ties identically
//! 3. **Concurrency**: `find_since` must be safe to call concurrently with
//!    `save`; implementations handle their own internal locking
//! 4. **Retention**: `delete_older_than` removes everything strictly before
//!    the cutoff and reports how many envelopes were removed

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::envelope::EventEnvelope;
use crate::errors::RelayResult;

pub mod memory;

pub use memory::InMemoryEventStore;

/// Interface a durable envelope backend must implement
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an envelope. Idempotent upsert keyed by `envelope.id`:
    /// saving the same id twice leaves exactly one copy.
    async fn save(&self, envelope: EventEnvelope) -> RelayResult<()>;

    /// Return all envelopes with `created_at >= since`, ascending by
    /// `(created_at, id)`.
    async fn find_since(&self, since: DateTime<Utc>) -> RelayResult<Vec<EventEnvelope>>;

    /// Remove all envelopes with `created_at < cutoff`; returns the number
    /// of envelopes removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> RelayResult<u64>;
}
