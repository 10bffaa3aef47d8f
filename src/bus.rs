//! Local event bus seam
//!
//! The distribution subsystem does not own the in-process publish/subscribe
//! primitive; application code already has one. This module defines the
//! interface the server and client components need from it, plus a
//! broadcast-channel-backed implementation for processes that do not bring
//! their own.
//!
//! Components receive the bus by injection; there is no process-wide
//! singleton.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::envelope::DomainEvent;
use crate::errors::RelayResult;

/// Shared handle to a published event
pub type SharedEvent = Arc<dyn DomainEvent>;

/// The local publish/subscribe primitive as seen by this subsystem
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to all current subscribers
    async fn publish(&self, event: SharedEvent) -> RelayResult<()>;

    /// Subscribe to every event published after this call
    fn subscribe_all(&self) -> broadcast::Receiver<SharedEvent>;
}

/// In-process bus backed by a tokio broadcast channel
pub struct BroadcastBus {
    sender: broadcast::Sender<SharedEvent>,
}

impl BroadcastBus {
    /// Default channel capacity; slow subscribers past this lag lose events
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, event: SharedEvent) -> RelayResult<()> {
        let event_type = event.event_type().to_string();
        // A send error only means there are no subscribers right now; the
        // publish itself still succeeds.
        match self.sender.send(event) {
            Ok(subscribers) => {
                debug!(event_type = %event_type, subscribers, "Published event");
                Ok(())
            }
            Err(broadcast::error::SendError(_)) => {
                debug!(event_type = %event_type, "Published event with no subscribers");
                Ok(())
            }
        }
    }

    fn subscribe_all(&self) -> broadcast::Receiver<SharedEvent> {
        self.sender.subscribe()
    }
}
