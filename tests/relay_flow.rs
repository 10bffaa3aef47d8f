//! End-to-end distribution tests
//!
//! Runs the full pipeline over a real socket: events published on the
//! server-side bus are persisted, polled by a client, and republished on the
//! client-side bus; with auto-forward enabled, client-side publications
//! travel the other way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use event_relay::{
    ApiServer, ApiState, AuthContext, BroadcastBus, DomainEvent, EventBus, EventRegistry,
    EventStore, InMemoryEventStore, RelayClient, RelayClientConfig, RelayServer,
    RelayServerConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct AccountOpened {
    account_id: Uuid,
    owner: String,
    opened_at: DateTime<Utc>,
}

impl AccountOpened {
    fn new(owner: &str) -> Self {
        Self {
            account_id: Uuid::now_v7(),
            owner: owner.to_string(),
            opened_at: Utc::now(),
        }
    }
}

impl DomainEvent for AccountOpened {
    fn event_type(&self) -> &str {
        "AccountOpened"
    }

    fn aggregate_id(&self) -> Uuid {
        self.account_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn auth_context(&self) -> AuthContext {
        AuthContext::for_user(self.owner.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct Fixture {
    server_bus: Arc<BroadcastBus>,
    store: Arc<InMemoryEventStore>,
    relay: RelayServer,
    api: ApiServer,
}

/// Capture logs per test; honors `RUST_LOG` when set
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Fixture {
    async fn start(retention: Option<Duration>) -> Self {
        init_tracing();
        let server_bus = Arc::new(BroadcastBus::new());
        let store = Arc::new(InMemoryEventStore::new());

        let relay = RelayServer::start(
            server_bus.clone(),
            store.clone(),
            RelayServerConfig {
                retention,
                on_error: None,
            },
        );

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let api = ApiServer::bind(addr, Arc::new(ApiState::new(store.clone())))
            .await
            .unwrap();

        Self {
            server_bus,
            store,
            relay,
            api,
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.api.local_addr())
    }

    fn client_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            base_url: self.base_url(),
            poll_interval: Duration::from_millis(25),
            request_timeout: Duration::from_secs(2),
            initial_cursor: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..RelayClientConfig::default()
        }
    }

    fn shutdown(mut self) {
        self.relay.close();
        self.api.close();
    }
}

fn registry() -> Arc<EventRegistry> {
    Arc::new(
        EventRegistry::builder()
            .register::<AccountOpened>("AccountOpened")
            .build(),
    )
}

#[tokio::test]
async fn server_publication_reaches_client_bus() {
    let fixture = Fixture::start(None).await;

    let client_bus = Arc::new(BroadcastBus::new());
    let mut remote_events = client_bus.subscribe_all();
    let mut client =
        RelayClient::start(fixture.client_config(), registry(), client_bus.clone()).unwrap();

    let opened = AccountOpened::new("alice");
    fixture
        .server_bus
        .publish(Arc::new(opened.clone()))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), remote_events.recv())
        .await
        .expect("remote event arrives within two seconds")
        .unwrap();
    let received = received
        .as_any()
        .downcast_ref::<AccountOpened>()
        .expect("registered type");
    assert_eq!(*received, opened);

    // The envelope carried the auth attributes flat
    let envelopes = fixture
        .store
        .find_since(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].user_id.as_deref(), Some("alice"));

    client.close();
    fixture.shutdown();
}

#[tokio::test]
async fn client_publication_flows_back_via_auto_forward() {
    let fixture = Fixture::start(None).await;

    let client_bus = Arc::new(BroadcastBus::new());
    let mut client = RelayClient::start(
        RelayClientConfig {
            auto_forward: true,
            ..fixture.client_config()
        },
        registry(),
        client_bus.clone(),
    )
    .unwrap();

    let opened = AccountOpened::new("bob");
    client_bus.publish(Arc::new(opened.clone())).await.unwrap();

    let mut stored = Vec::new();
    for _ in 0..80 {
        stored = fixture
            .store
            .find_since(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        if !stored.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(stored.len(), 1, "exactly one forwarded envelope");
    let restored: AccountOpened = serde_json::from_str(&stored[0].payload).unwrap();
    assert_eq!(restored, opened);

    // The client polls its own forwarded event back; the echo guard must
    // keep it from being submitted again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.store.len().await, 1);

    client.close();
    fixture.shutdown();
}

#[tokio::test]
async fn two_clients_both_observe_a_server_event() {
    let fixture = Fixture::start(None).await;

    let bus_a = Arc::new(BroadcastBus::new());
    let bus_b = Arc::new(BroadcastBus::new());
    let mut events_a = bus_a.subscribe_all();
    let mut events_b = bus_b.subscribe_all();

    let mut client_a =
        RelayClient::start(fixture.client_config(), registry(), bus_a.clone()).unwrap();
    let mut client_b =
        RelayClient::start(fixture.client_config(), registry(), bus_b.clone()).unwrap();

    let opened = AccountOpened::new("carol");
    fixture
        .server_bus
        .publish(Arc::new(opened.clone()))
        .await
        .unwrap();

    for events in [&mut events_a, &mut events_b] {
        let received = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("each client observes the event")
            .unwrap();
        assert_eq!(
            received.as_any().downcast_ref::<AccountOpened>().unwrap(),
            &opened
        );
    }

    client_a.close();
    client_b.close();
    fixture.shutdown();
}

#[tokio::test]
async fn offline_client_catches_up_from_its_cursor() {
    let fixture = Fixture::start(None).await;

    // Events accumulate while no client is running
    let first = AccountOpened::new("dave");
    let second = AccountOpened::new("erin");
    let before_all = Utc::now() - chrono::Duration::seconds(1);
    for event in [&first, &second] {
        fixture
            .server_bus
            .publish(Arc::new(event.clone()))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client_bus = Arc::new(BroadcastBus::new());
    let mut remote_events = client_bus.subscribe_all();
    let mut client = RelayClient::start(
        RelayClientConfig {
            initial_cursor: Some(before_all),
            ..fixture.client_config()
        },
        registry(),
        client_bus.clone(),
    )
    .unwrap();

    let got_first = remote_events.recv().await.unwrap();
    let got_second = remote_events.recv().await.unwrap();
    assert_eq!(
        got_first.as_any().downcast_ref::<AccountOpened>().unwrap(),
        &first
    );
    assert_eq!(
        got_second.as_any().downcast_ref::<AccountOpened>().unwrap(),
        &second
    );

    client.close();
    fixture.shutdown();
}

#[tokio::test]
async fn cleanup_trims_history_served_to_late_clients() {
    let fixture = Fixture::start(Some(Duration::from_secs(7 * 24 * 60 * 60))).await;

    let now = Utc::now();
    let mut expired = event_relay::EventEnvelope::wrap(&AccountOpened::new("old")).unwrap();
    expired.created_at = now - chrono::Duration::days(10);
    let mut recent = event_relay::EventEnvelope::wrap(&AccountOpened::new("new")).unwrap();
    recent.created_at = now - chrono::Duration::days(3);
    fixture.store.save(expired).await.unwrap();
    fixture.store.save(recent.clone()).await.unwrap();

    let removed = fixture.relay.cleanup().await.unwrap();
    assert_eq!(removed, 1);

    let served = reqwest::get(format!(
        "{}/events?since={}",
        fixture.base_url(),
        urlencoded_rfc3339(now - chrono::Duration::days(30)),
    ))
    .await
    .unwrap()
    .json::<Vec<event_relay::EventEnvelope>>()
    .await
    .unwrap();

    assert_eq!(served.len(), 1);
    assert_eq!(served[0].id, recent.id);

    fixture.shutdown();
}

fn urlencoded_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339().replace('+', "%2B").replace(':', "%3A")
}
