//! Event distribution across process boundaries
//!
//! Independently-deployed applications observe each other's state changes
//! without sharing a database: a server-side component persists every local
//! publication as a durable envelope, and client-side components poll for
//! envelopes since a cursor, reconstruct the original events through a
//! registry, and republish them on their own local bus.
//!
//! ```text
//! local publish → RelayServer → EventStore ← GET /events?since=T
//!                                                │
//!                              RelayClient ← registry reconstruct
//!                                    │
//!                              local republish (→ optional POST /events)
//! ```

pub mod api;
pub mod bus;
pub mod client;
pub mod envelope;
pub mod errors;
pub mod registry;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use api::{ApiServer, ApiState, AuthPredicate, RequestContext};
pub use bus::{BroadcastBus, EventBus, SharedEvent};
pub use client::{RelayClient, RelayClientConfig, RetryPolicy};
pub use envelope::{AuthContext, DomainEvent, EventEnvelope};
pub use errors::{RelayError, RelayResult};
pub use registry::{EventRegistry, EventRegistryBuilder, Reconstructor};
pub use server::{ErrorObserver, RelayServer, RelayServerConfig};
pub use store::{EventStore, InMemoryEventStore};
