//! Server component
//!
//! Bridges "local publish" to "durable, queryable storage". On construction
//! the server subscribes to all events on the injected local bus and, for
//! every publication, wraps the event into an envelope and saves it through
//! the storage contract.
//!
//! Persistence is best-effort by design: the local publish has already
//! returned by the time the listener runs, so a wrap or save failure is
//! logged (and reported to the injected error observer) and never surfaces
//! to the publisher.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::envelope::EventEnvelope;
use crate::errors::{RelayError, RelayResult};
use crate::store::EventStore;

/// Callback invoked for every failure the best-effort paths swallow.
///
/// Keeps the fire-and-forget persistence contract testable: a caller can
/// observe failures without any exception ever reaching the publisher.
pub type ErrorObserver = Arc<dyn Fn(&RelayError) + Send + Sync>;

/// Configuration for [`RelayServer`]
#[derive(Clone, Default)]
pub struct RelayServerConfig {
    /// How long envelopes are kept; `None` disables cleanup
    pub retention: Option<Duration>,

    /// Observer for swallowed persistence failures
    pub on_error: Option<ErrorObserver>,
}

impl std::fmt::Debug for RelayServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServerConfig")
            .field("retention", &self.retention)
            .field("on_error", &self.on_error.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

/// Persists every local publication and exposes retention cleanup
pub struct RelayServer {
    store: Arc<dyn EventStore>,
    retention: Option<Duration>,
    shutdown: Option<oneshot::Sender<()>>,
    listener: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Subscribe to the bus and start the persistence listener
    pub fn start(
        bus: Arc<dyn EventBus>,
        store: Arc<dyn EventStore>,
        config: RelayServerConfig,
    ) -> Self {
        let receiver = bus.subscribe_all();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let listener = tokio::spawn(Self::run_listener(
            receiver,
            Arc::clone(&store),
            config.on_error.clone(),
            shutdown_rx,
        ));

        info!(retention = ?config.retention, "Relay server started");

        Self {
            store,
            retention: config.retention,
            shutdown: Some(shutdown_tx),
            listener: Some(listener),
        }
    }

    async fn run_listener(
        receiver: broadcast::Receiver<crate::bus::SharedEvent>,
        store: Arc<dyn EventStore>,
        on_error: Option<ErrorObserver>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut events = BroadcastStream::new(receiver);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Persistence listener shutting down");
                    break;
                }
                next = events.next() => {
                    match next {
                        Some(Ok(event)) => {
                            Self::persist(event.as_ref(), store.as_ref(), on_error.as_ref()).await;
                        }
                        Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                            let err = RelayError::Persistence(format!(
                                "listener lagged, {missed} events not persisted"
                            ));
                            error!(missed, "Persistence listener lagged behind the bus");
                            if let Some(observer) = &on_error {
                                observer(&err);
                            }
                        }
                        None => {
                            warn!("Local bus closed, persistence listener stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Wrap and save one event; failures are logged and observed, never raised
    async fn persist(
        event: &dyn crate::envelope::DomainEvent,
        store: &dyn EventStore,
        on_error: Option<&ErrorObserver>,
    ) {
        let event_type = event.event_type().to_string();

        let envelope = match EventEnvelope::wrap(event) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(event_type = %event_type, error = %err, "Failed to wrap event");
                if let Some(observer) = on_error {
                    observer(&err);
                }
                return;
            }
        };

        match store.save(envelope).await {
            Ok(()) => {
                debug!(event_type = %event_type, "Persisted event");
            }
            Err(err) => {
                error!(event_type = %event_type, error = %err, "Failed to persist event");
                if let Some(observer) = on_error {
                    observer(&err);
                }
            }
        }
    }

    /// Remove envelopes older than the configured retention.
    ///
    /// Caller-invoked (by an external scheduler); the server runs no timer
    /// of its own. Without a configured retention this is a warning no-op.
    pub async fn cleanup(&self) -> RelayResult<u64> {
        let Some(retention) = self.retention else {
            warn!("Cleanup invoked without a configured retention, skipping");
            return Ok(0);
        };

        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| RelayError::Configuration(format!("retention out of range: {e}")))?;
        let cutoff = chrono::Utc::now() - retention;

        let removed = self.store.delete_older_than(cutoff).await?;
        info!(removed, cutoff = %cutoff, "Removed expired envelopes");
        Ok(removed)
    }

    /// Cancel the bus subscription. Idempotent; the storage backend's
    /// lifecycle is owned externally and is not touched.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            info!("Relay server closed");
        }
        if let Some(listener) = self.listener.take() {
            drop(listener);
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.close();
    }
}
