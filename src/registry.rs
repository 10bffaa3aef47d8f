//! Event registry
//!
//! Maps an event type name to a reconstructor that rebuilds the original
//! domain event from an envelope's payload. The registry is built once at
//! startup from the set of known event shapes and is read-only afterwards,
//! an explicit factory map rather than any runtime type discovery.
//!
//! A lookup miss is not an error: the caller is expected to log a warning
//! and skip the envelope, since unknown types are a normal consequence of
//! independently-deployed applications evolving at different speeds.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::envelope::DomainEvent;
use crate::errors::{RelayError, RelayResult};

/// Rebuilds a domain event from its opaque payload.
///
/// A reconstruction failure is recoverable: it affects only the envelope it
/// was invoked for, never the rest of a batch.
pub type Reconstructor =
    Arc<dyn Fn(&str) -> RelayResult<Arc<dyn DomainEvent>> + Send + Sync>;

/// Read-only map from event type name to reconstructor
pub struct EventRegistry {
    entries: HashMap<String, Reconstructor>,
}

impl EventRegistry {
    /// Start building a registry
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder {
            entries: HashMap::new(),
        }
    }

    /// Look up the reconstructor for an event type; `None` means "skip"
    pub fn lookup(&self, event_type: &str) -> Option<&Reconstructor> {
        self.entries.get(event_type)
    }

    /// Whether a reconstructor is registered for the given type
    pub fn contains(&self, event_type: &str) -> bool {
        self.entries.contains_key(event_type)
    }

    /// Number of registered event types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for [`EventRegistry`]
pub struct EventRegistryBuilder {
    entries: HashMap<String, Reconstructor>,
}

impl EventRegistryBuilder {
    /// Register a deserializable event type under the given name.
    ///
    /// The installed reconstructor deserializes the payload with serde and
    /// reports malformed payloads as a recoverable serialization error.
    pub fn register<E>(mut self, event_type: impl Into<String>) -> Self
    where
        E: DomainEvent + DeserializeOwned + 'static,
    {
        let name = event_type.into();
        let reconstructor: Reconstructor = Arc::new(move |payload: &str| {
            let event: E = serde_json::from_str(payload)
                .map_err(|e| RelayError::Serialization(e.to_string()))?;
            Ok(Arc::new(event) as Arc<dyn DomainEvent>)
        });
        self.entries.insert(name, reconstructor);
        self
    }

    /// Register a custom reconstructor for event shapes that need more than
    /// a plain serde deserialization
    pub fn register_with(
        mut self,
        event_type: impl Into<String>,
        reconstructor: Reconstructor,
    ) -> Self {
        self.entries.insert(event_type.into(), reconstructor);
        self
    }

    /// Finish building; the registry is immutable from here on
    pub fn build(self) -> EventRegistry {
        EventRegistry {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::AuthContext;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::any::Any;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct CustomerRenamed {
        customer_id: Uuid,
        new_name: String,
        renamed_at: DateTime<Utc>,
    }

    impl DomainEvent for CustomerRenamed {
        fn event_type(&self) -> &str {
            "CustomerRenamed"
        }

        fn aggregate_id(&self) -> Uuid {
            self.customer_id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.renamed_at
        }

        fn payload(&self) -> Result<String, serde_json::Error> {
            serde_json::to_string(self)
        }

        fn auth_context(&self) -> AuthContext {
            AuthContext::default()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry() -> EventRegistry {
        EventRegistry::builder()
            .register::<CustomerRenamed>("CustomerRenamed")
            .build()
    }

    #[test]
    fn lookup_hit_reconstructs_event() {
        let original = CustomerRenamed {
            customer_id: Uuid::now_v7(),
            new_name: "Acme Corp".to_string(),
            renamed_at: Utc::now(),
        };
        let payload = original.payload().unwrap();

        let registry = registry();
        let reconstructor = registry.lookup("CustomerRenamed").unwrap();
        let event = reconstructor(&payload).unwrap();

        let restored = event
            .as_any()
            .downcast_ref::<CustomerRenamed>()
            .expect("reconstructed event has the registered type");
        assert_eq!(*restored, original);
    }

    #[test]
    fn lookup_miss_is_none_not_error() {
        let registry = registry();
        assert!(registry.lookup("NeverRegistered").is_none());
        assert!(!registry.contains("NeverRegistered"));
    }

    #[test]
    fn malformed_payload_is_recoverable_error() {
        let registry = registry();
        let reconstructor = registry.lookup("CustomerRenamed").unwrap();

        let err = reconstructor("{not json").err().unwrap();
        assert!(matches!(err, RelayError::Serialization(_)));
    }

    #[test]
    fn later_registration_wins_for_duplicate_names() {
        let registry = EventRegistry::builder()
            .register_with(
                "CustomerRenamed",
                Arc::new(|_| Err(RelayError::Serialization("shadowed".to_string()))),
            )
            .register::<CustomerRenamed>("CustomerRenamed")
            .build();

        assert_eq!(registry.len(), 1);
        let payload = CustomerRenamed {
            customer_id: Uuid::now_v7(),
            new_name: "x".to_string(),
            renamed_at: Utc::now(),
        }
        .payload()
        .unwrap();
        assert!(registry.lookup("CustomerRenamed").unwrap()(&payload).is_ok());
    }
}
