//! HTTP protocol layer
//!
//! Exposes the storage contract over two operations:
//! - `GET /events?since=<RFC3339>` polls envelopes created at or after the
//!   given instant, ascending by `(created_at, id)`
//! - `POST /events` submits one already-wrapped envelope
//!
//! An optional per-request authorization predicate filters the poll
//! response envelope by envelope. A predicate that panics for one envelope
//! excludes that envelope only; it never aborts the response.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::errors::{RelayError, RelayResult};
use crate::store::EventStore;

/// Identity attributes of the caller, taken from request headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            user_id: header("x-user-id"),
            tenant_id: header("x-tenant-id"),
            session_id: header("x-session-id"),
        }
    }
}

/// Per-envelope authorization filter for the poll path
pub type AuthPredicate = Arc<dyn Fn(&EventEnvelope, &RequestContext) -> bool + Send + Sync>;

/// Shared state behind the protocol handlers
pub struct ApiState {
    store: Arc<dyn EventStore>,
    authorize: Option<AuthPredicate>,
}

impl ApiState {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            authorize: None,
        }
    }

    /// Install an authorization predicate; without one, poll responses are
    /// returned unfiltered
    pub fn with_authorization(mut self, predicate: AuthPredicate) -> Self {
        self.authorize = Some(predicate);
        self
    }
}

#[derive(Debug, Deserialize)]
struct PollParams {
    since: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SubmitAccepted {
    id: Uuid,
    created_at: DateTime<Utc>,
}

/// GET /events?since=<RFC3339>
async fn poll_since(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // Validate before touching storage
    let since = match params.since.as_deref() {
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "missing required query parameter 'since'".to_string(),
                }),
            )
                .into_response();
        }
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorBody {
                        error: format!("invalid 'since' timestamp '{raw}': {e}"),
                    }),
                )
                    .into_response();
            }
        },
    };

    let envelopes = match state.store.find_since(since).await {
        Ok(envelopes) => envelopes,
        Err(e) => {
            error!(error = %e, since = %since, "Poll query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "storage failure".to_string(),
                }),
            )
                .into_response();
        }
    };

    let visible = match &state.authorize {
        None => envelopes,
        Some(predicate) => {
            let context = RequestContext::from_headers(&headers);
            envelopes
                .into_iter()
                .filter(|envelope| {
                    match catch_unwind(AssertUnwindSafe(|| predicate(envelope, &context))) {
                        Ok(allowed) => allowed,
                        Err(_) => {
                            error!(
                                envelope_id = %envelope.id,
                                event_type = %envelope.event_type,
                                "Authorization predicate panicked, excluding envelope"
                            );
                            false
                        }
                    }
                })
                .collect()
        }
    };

    debug!(since = %since, count = visible.len(), "Served poll request");
    (StatusCode::OK, Json(visible)).into_response()
}

/// POST /events with body = one envelope
async fn submit_event(
    State(state): State<Arc<ApiState>>,
    Json(envelope): Json<EventEnvelope>,
) -> impl IntoResponse {
    let accepted = SubmitAccepted {
        id: envelope.id,
        created_at: envelope.created_at,
    };

    match state.store.save(envelope).await {
        Ok(()) => {
            debug!(envelope_id = %accepted.id, "Accepted submitted envelope");
            (StatusCode::CREATED, Json(accepted)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to persist submitted envelope");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "storage failure".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Build the protocol router
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/events", get(poll_since).post(submit_event))
        .with_state(state)
}

/// Bound HTTP server hosting the protocol layer
///
/// Wraps `axum::serve` with oneshot-signalled graceful shutdown so tests and
/// embedders can run the protocol on an ephemeral port.
pub struct ApiServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    /// Bind and start serving; `addr` may use port 0 for an ephemeral port
    pub async fn bind(addr: SocketAddr, state: Arc<ApiState>) -> RelayResult<Self> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Transport(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let router = create_router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            info!(addr = %local_addr, "Event relay API listening");
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    info!("Event relay API shutting down");
                })
                .await
            {
                warn!(error = %e, "Event relay API exited with error");
            }
        });

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Address the server is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown; idempotent, in-flight requests are allowed to finish
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.take();
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.close();
    }
}
