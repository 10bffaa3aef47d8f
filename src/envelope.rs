//! Stored event envelope
//!
//! The envelope is the immutable unit persisted by the storage contract and
//! transmitted over the polling protocol. It wraps one domain event with:
//! - A globally unique, time-ordered id (UUID v7)
//! - The instant the event occurred (`created_at`, the catch-up cursor key)
//! - The originating aggregate id (opaque to this subsystem)
//! - The event type name used for registry lookup
//! - An opaque, externally-serialized payload
//! - Flat authorization attributes for backend-side indexing and filtering
//!
//! Envelopes are append-only: there is no updated-at, and `save` on the
//! storage contract is an idempotent upsert keyed by id.

use std::any::Any;
use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{RelayError, RelayResult};

/// Flat authorization attributes carried alongside an event.
///
/// All fields are optional; an event with no metadata produces an empty
/// context and wrapping never fails because of absent fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Identity of the user on whose behalf the event was raised
    pub user_id: Option<String>,
    /// Tenant the event belongs to
    pub tenant_id: Option<String>,
    /// Session in which the event was raised
    pub session_id: Option<String>,
}

impl AuthContext {
    /// Context with only a user id set
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }
}

/// A domain event as seen by the distribution subsystem.
///
/// Application event types implement this trait; the payload methods are the
/// seam to the external (de)serializer, typically `serde_json::to_string`
/// over the event's own fields.
pub trait DomainEvent: Send + Sync {
    /// Logical type name, used as the registry lookup key
    fn event_type(&self) -> &str;

    /// Identifier of the domain object that raised the event
    fn aggregate_id(&self) -> Uuid;

    /// Instant the event occurred
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Serialize the event's fields into an opaque payload
    fn payload(&self) -> Result<String, serde_json::Error>;

    /// Authorization attributes extracted from the event's metadata
    fn auth_context(&self) -> AuthContext {
        AuthContext::default()
    }

    /// Downcast support for handlers that need the concrete event type
    fn as_any(&self) -> &dyn Any;
}

/// Stored event envelope
///
/// Serializes to the wire shape used by both the storage contract and the
/// polling protocol. Optional authorization fields appear as `null` rather
/// than being omitted, so every envelope has an identical set of keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique envelope id, assigned once at wrap time
    pub id: Uuid,

    /// Instant the originating event occurred
    pub created_at: DateTime<Utc>,

    /// Aggregate that raised the event
    pub aggregate_id: Uuid,

    /// Event type name (registry lookup key)
    pub event_type: String,

    /// Opaque, externally-serialized event fields
    pub payload: String,

    /// Authorization: user identity, if known
    pub user_id: Option<String>,

    /// Authorization: tenant, if known
    pub tenant_id: Option<String>,

    /// Authorization: session, if known
    pub session_id: Option<String>,
}

impl EventEnvelope {
    /// Wrap a domain event into a new envelope.
    ///
    /// Assigns a fresh v7 id, takes `created_at` from the event's own
    /// `occurred_at`, serializes the remaining fields into the payload, and
    /// copies recognized authorization attributes into the flat fields.
    pub fn wrap(event: &dyn DomainEvent) -> RelayResult<Self> {
        let payload = event
            .payload()
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        let auth = event.auth_context();

        Ok(Self {
            id: Uuid::now_v7(),
            created_at: event.occurred_at(),
            aggregate_id: event.aggregate_id(),
            event_type: event.event_type().to_string(),
            payload,
            user_id: auth.user_id,
            tenant_id: auth.tenant_id,
            session_id: auth.session_id,
        })
    }

    /// Deterministic ordering key: `(created_at, id)`.
    ///
    /// `created_at` is the catch-up cursor, so ties between envelopes with
    /// identical timestamps must resolve the same way everywhere; the v7 id
    /// provides a stable secondary key.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }

    /// Compare two envelopes by `(created_at, id)`
    pub fn cmp_by_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}
