//! Client component
//!
//! Maintains a cursor, periodically polls the server for envelopes created
//! since that cursor, deserializes them through the event registry, and
//! republishes the reconstructed events on the client's own local bus.
//! Optionally forwards the client's own local publications back to the
//! server over the submit path.
//!
//! The poll loop is single-flight: one cycle runs to completion (success or
//! failure) before the next timer tick can start another. A transport
//! failure leaves the cursor untouched, so the next tick retries the same
//! window; missed envelopes are caught up, never lost.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, SharedEvent};
use crate::envelope::EventEnvelope;
use crate::errors::{RelayError, RelayResult};
use crate::registry::EventRegistry;
use crate::server::ErrorObserver;

/// Retry behavior for the auto-forward path.
///
/// The default is no retry: a forwarded event that fails to submit is logged
/// and dropped, unlike the poll path which self-heals via cursor replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Log and drop on failure
    #[default]
    None,
    /// Retry a failed submit up to `attempts` additional times, waiting
    /// `delay` between attempts
    Fixed { attempts: u32, delay: Duration },
}

/// Configuration for [`RelayClient`]
#[derive(Clone)]
pub struct RelayClientConfig {
    /// Base URL of the server hosting the protocol layer
    pub base_url: String,

    /// Time between poll cycles
    pub poll_interval: Duration,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    /// Starting cursor; `None` means "now" at client start
    pub initial_cursor: Option<DateTime<Utc>>,

    /// Whether local publications are forwarded to the server
    pub auto_forward: bool,

    /// Retry behavior for forwarded submits
    pub forward_retry: RetryPolicy,

    /// Observer for failures the poll and forward loops swallow
    pub on_error: Option<ErrorObserver>,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            initial_cursor: None,
            auto_forward: false,
            forward_retry: RetryPolicy::default(),
            on_error: None,
        }
    }
}

impl std::fmt::Debug for RelayClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClientConfig")
            .field("base_url", &self.base_url)
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .field("initial_cursor", &self.initial_cursor)
            .field("auto_forward", &self.auto_forward)
            .field("forward_retry", &self.forward_retry)
            .field("on_error", &self.on_error.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

/// Suppression list shared between the poll and forward loops.
///
/// The forwarder subscribes to all local publications, which includes events
/// the poll loop itself just republished; forwarding those would bounce every
/// remote event back to the server under a fresh envelope id. The poll loop
/// registers each event here immediately before republishing it, and the
/// forwarder drops exactly those, matched by pointer identity. The guard is
/// only allocated alongside a forward loop; with forwarding disabled the
/// poll loop keeps no reference to what it republished.
#[derive(Default)]
struct ForwardGuard {
    suppressed: Mutex<Vec<SharedEvent>>,
}

impl ForwardGuard {
    const CAPACITY: usize = 1024;

    fn suppress(&self, event: &SharedEvent) {
        let mut suppressed = self.suppressed.lock().unwrap();
        if suppressed.len() >= Self::CAPACITY {
            suppressed.remove(0);
        }
        suppressed.push(Arc::clone(event));
    }

    fn take(&self, event: &SharedEvent) -> bool {
        let mut suppressed = self.suppressed.lock().unwrap();
        if let Some(index) = suppressed.iter().position(|e| Arc::ptr_eq(e, event)) {
            suppressed.swap_remove(index);
            true
        } else {
            false
        }
    }
}

/// Polls the server and feeds remote events onto the local bus
pub struct RelayClient {
    cursor: watch::Receiver<DateTime<Utc>>,
    poll_shutdown: Option<oneshot::Sender<()>>,
    forward_shutdown: Option<oneshot::Sender<()>>,
    poll_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Build the HTTP client and start the poll loop (and, when configured,
    /// the forward loop)
    pub fn start(
        config: RelayClientConfig,
        registry: Arc<EventRegistry>,
        bus: Arc<dyn EventBus>,
    ) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Configuration(format!("HTTP client: {e}")))?;

        let initial_cursor = config.initial_cursor.unwrap_or_else(Utc::now);
        let (cursor_tx, cursor_rx) = watch::channel(initial_cursor);

        // Without a forward loop there is nothing to suppress, so no guard
        // is allocated and republished events are never pinned.
        let guard = config
            .auto_forward
            .then(|| Arc::new(ForwardGuard::default()));

        let (poll_shutdown_tx, poll_shutdown_rx) = oneshot::channel();
        let poll_task = tokio::spawn(run_poll_loop(
            PollLoop {
                http: http.clone(),
                base_url: config.base_url.clone(),
                registry,
                bus: Arc::clone(&bus),
                guard: guard.clone(),
                cursor: cursor_tx,
                on_error: config.on_error.clone(),
            },
            config.poll_interval,
            poll_shutdown_rx,
        ));

        let (forward_shutdown, forward_task) = if let Some(guard) = guard {
            let (tx, rx) = oneshot::channel();
            let task = tokio::spawn(run_forward_loop(
                ForwardLoop {
                    http,
                    base_url: config.base_url.clone(),
                    guard,
                    retry: config.forward_retry.clone(),
                    on_error: config.on_error.clone(),
                },
                bus.subscribe_all(),
                rx,
            ));
            (Some(tx), Some(task))
        } else {
            (None, None)
        };

        info!(
            base_url = %config.base_url,
            poll_interval = ?config.poll_interval,
            cursor = %initial_cursor,
            auto_forward = config.auto_forward,
            "Relay client started"
        );

        Ok(Self {
            cursor: cursor_rx,
            poll_shutdown: Some(poll_shutdown_tx),
            forward_shutdown,
            poll_task: Some(poll_task),
            forward_task,
        })
    }

    /// Current cursor watermark: everything up to and including this instant
    /// has been processed
    pub fn cursor(&self) -> DateTime<Utc> {
        *self.cursor.borrow()
    }

    /// Stop the poll loop and any forwarding subscription. Idempotent;
    /// an in-flight cycle is allowed to finish.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.poll_shutdown.take() {
            let _ = shutdown.send(());
            info!("Relay client closed");
        }
        if let Some(shutdown) = self.forward_shutdown.take() {
            let _ = shutdown.send(());
        }
        self.poll_task = None;
        self.forward_task = None;
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
    }
}

struct PollLoop {
    http: reqwest::Client,
    base_url: String,
    registry: Arc<EventRegistry>,
    bus: Arc<dyn EventBus>,
    guard: Option<Arc<ForwardGuard>>,
    cursor: watch::Sender<DateTime<Utc>>,
    on_error: Option<ErrorObserver>,
}

impl PollLoop {
    fn observe(&self, err: &RelayError) {
        if let Some(observer) = &self.on_error {
            observer(err);
        }
    }

    /// One full poll cycle. Transport failure leaves the cursor untouched;
    /// per-envelope failures skip that envelope only.
    async fn poll_once(&self, seen_at_cursor: &mut HashSet<Uuid>) {
        let since = *self.cursor.borrow();

        let envelopes = match self.fetch_since(since).await {
            Ok(envelopes) => envelopes,
            Err(err) => {
                warn!(error = %err, cursor = %since, "Poll failed, will retry next tick");
                self.observe(&err);
                return;
            }
        };

        let mut max_seen: Option<DateTime<Utc>> = None;
        let mut processed_at_max: HashSet<Uuid> = HashSet::new();

        for envelope in envelopes {
            // The storage contract's range is inclusive, so envelopes at
            // exactly the cursor instant come back again; skip the ones
            // already processed without giving up tie safety.
            if envelope.created_at == since && seen_at_cursor.contains(&envelope.id) {
                continue;
            }

            match max_seen {
                Some(max) if envelope.created_at > max => {
                    max_seen = Some(envelope.created_at);
                    processed_at_max.clear();
                }
                None => max_seen = Some(envelope.created_at),
                _ => {}
            }
            processed_at_max.insert(envelope.id);

            self.deliver(&envelope).await;
        }

        if let Some(max) = max_seen {
            // Never move the cursor backward
            self.cursor.send_if_modified(|cursor| {
                if max > *cursor {
                    *cursor = max;
                    true
                } else {
                    false
                }
            });
            if max > since {
                *seen_at_cursor = processed_at_max;
            } else {
                seen_at_cursor.extend(processed_at_max);
            }
            debug!(cursor = %*self.cursor.borrow(), "Poll cycle complete");
        }
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> RelayResult<Vec<EventEnvelope>> {
        let response = self
            .http
            .get(format!("{}/events", self.base_url))
            .query(&[("since", since.to_rfc3339())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "poll returned {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Reconstruct one envelope and republish it locally. Misses and
    /// malformed payloads are skipped; the envelope still counts as seen.
    async fn deliver(&self, envelope: &EventEnvelope) {
        let Some(reconstructor) = self.registry.lookup(&envelope.event_type) else {
            warn!(
                event_type = %envelope.event_type,
                envelope_id = %envelope.id,
                "No reconstructor registered, skipping envelope"
            );
            return;
        };

        let event = match reconstructor(&envelope.payload) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    event_type = %envelope.event_type,
                    envelope_id = %envelope.id,
                    error = %err,
                    "Failed to reconstruct event, skipping envelope"
                );
                self.observe(&err);
                return;
            }
        };

        // Suppress before publishing so the forward loop can never observe
        // the event without its guard entry.
        if let Some(guard) = &self.guard {
            guard.suppress(&event);
        }

        if let Err(err) = self.bus.publish(Arc::clone(&event)).await {
            error!(
                event_type = %envelope.event_type,
                error = %err,
                "Failed to republish remote event locally"
            );
            if let Some(guard) = &self.guard {
                guard.take(&event);
            }
            self.observe(&err);
        }
    }
}

async fn run_poll_loop(
    poll: PollLoop,
    interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seen_at_cursor: HashSet<Uuid> = HashSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Poll loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                poll.poll_once(&mut seen_at_cursor).await;
            }
        }
    }
}

struct ForwardLoop {
    http: reqwest::Client,
    base_url: String,
    guard: Arc<ForwardGuard>,
    retry: RetryPolicy,
    on_error: Option<ErrorObserver>,
}

impl ForwardLoop {
    fn observe(&self, err: &RelayError) {
        if let Some(observer) = &self.on_error {
            observer(err);
        }
    }

    /// Wrap one local publication and submit it, honoring the retry policy.
    /// A final failure is logged and the event dropped.
    async fn forward(&self, event: SharedEvent) {
        let event_type = event.event_type().to_string();

        let envelope = match EventEnvelope::wrap(event.as_ref()) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(event_type = %event_type, error = %err, "Failed to wrap event for forwarding");
                self.observe(&err);
                return;
            }
        };

        let attempts = match self.retry {
            RetryPolicy::None => 1,
            RetryPolicy::Fixed { attempts, .. } => attempts.saturating_add(1),
        };

        for attempt in 1..=attempts {
            match self.submit(&envelope).await {
                Ok(()) => {
                    debug!(event_type = %event_type, envelope_id = %envelope.id, "Forwarded event");
                    return;
                }
                Err(err) => {
                    if attempt == attempts {
                        error!(
                            event_type = %event_type,
                            attempt,
                            error = %err,
                            "Failed to forward event, dropping"
                        );
                        self.observe(&err);
                    } else if let RetryPolicy::Fixed { delay, .. } = self.retry {
                        warn!(event_type = %event_type, attempt, error = %err, "Forward failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn submit(&self, envelope: &EventEnvelope) -> RelayResult<()> {
        let response = self
            .http
            .post(format!("{}/events", self.base_url))
            .json(envelope)
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(RelayError::Transport(format!("submit returned {status}"))),
        }
    }
}

async fn run_forward_loop(
    forward: ForwardLoop,
    mut receiver: broadcast::Receiver<SharedEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Forward loop shutting down");
                break;
            }
            received = receiver.recv() => {
                match received {
                    Ok(event) => {
                        if forward.guard.take(&event) {
                            // Republished remote event; never echo it back
                            continue;
                        }
                        forward.forward(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Forward loop lagged, local events not forwarded");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Local bus closed, forward loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
