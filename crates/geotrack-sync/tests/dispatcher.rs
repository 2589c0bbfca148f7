//! Sync dispatcher against a mock HTTP endpoint and an in-memory Event
//! Store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use geotrack_core::events::HttpEvent;
use geotrack_core::platform::{BackgroundLease, ConnectivityProbe, ManualConnectivity, NoopLease};
use geotrack_core::{EventBus, EventKind, Fix, LocationEvent, LocationRecord, TrackerEvent};
use geotrack_db::{Database, DbConfig};
use geotrack_sync::authorization::REFRESH_TOKEN_PLACEHOLDER;
use geotrack_sync::{
    AuthorizationConfig, FlushOutcome, FlushTrigger, HttpConfig, SyncDispatcher, SyncError,
    TokenAuthorization,
};
use reqwest::Client;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    db: Database,
    dispatcher: Arc<SyncDispatcher>,
    connectivity: Arc<ManualConnectivity>,
    lease: Arc<NoopLease>,
    events: Arc<EventBus>,
    http_events: Arc<Mutex<Vec<HttpEvent>>>,
}

async fn harness(config: HttpConfig) -> Harness {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let connectivity = Arc::new(ManualConnectivity::new(true));
    let lease = Arc::new(NoopLease::new());
    let events = Arc::new(EventBus::new());

    let http_events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&http_events);
    events.subscribe(EventKind::Http, move |event| {
        if let TrackerEvent::Http(e) = event {
            sink.lock().unwrap().push(e.clone());
        }
    });

    let probe: Arc<dyn ConnectivityProbe> = connectivity.clone();
    let lease_dyn: Arc<dyn BackgroundLease> = lease.clone();
    let dispatcher = Arc::new(SyncDispatcher::new(
        db.clone(),
        Client::new(),
        config,
        probe,
        lease_dyn,
        Arc::clone(&events),
    ));

    Harness {
        db,
        dispatcher,
        connectivity,
        lease,
        events,
        http_events,
    }
}

fn http_config(server: &MockServer) -> HttpConfig {
    HttpConfig {
        url: format!("{}/locations", server.uri()),
        ..Default::default()
    }
}

async fn persist(db: &Database, n: usize) {
    for i in 0..n {
        let fix = Fix::new(45.0 + i as f64 * 1e-3, -73.0, 10.0, Utc::now());
        let record = LocationRecord::from_fix(&fix, LocationEvent::Tracking, true, i as f64);
        db.locations().persist(&record).await.unwrap();
    }
}

#[tokio::test]
async fn successful_flush_empties_store_and_reports_count() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/locations"))
        .and(header("x-device", "van-12"))
        .and(body_partial_json(json!({"company": "acme"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.headers = BTreeMap::from([("X-Device".into(), "van-12".into())]);
    config.params.insert("company".into(), json!("acme"));
    let h = harness(config).await;
    persist(&h.db, 3).await;

    let outcome = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap();

    assert_eq!(outcome, FlushOutcome::Synced { count: 3 });
    assert_eq!(h.db.locations().count(false).await.unwrap(), 0);
    let events = h.http_events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].status, 200);
    assert_eq!(events[0].count, 3);
    assert_eq!(h.lease.outstanding(), 0);
    assert!(!h.dispatcher.is_busy());
}

#[tokio::test]
async fn unauthorized_with_failed_refresh_unlocks_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/locations"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(http_config(&server)).await;
    let auth = AuthorizationConfig {
        access_token: "expired-token".into(),
        refresh_token: "refresh-me".into(),
        refresh_url: format!("{}/token", server.uri()),
        refresh_payload: BTreeMap::from([("refresh_token".into(), REFRESH_TOKEN_PLACEHOLDER.into())]),
        ..Default::default()
    };
    h.dispatcher
        .set_authorization(Some(Arc::new(TokenAuthorization::new(
            auth,
            Client::new(),
            Arc::clone(&h.events),
        ))))
        .await;
    persist(&h.db, 3).await;

    let err = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap_err();

    assert!(matches!(err, SyncError::Authorization(_)));
    assert_eq!(h.db.locations().count(false).await.unwrap(), 3);
    assert_eq!(h.db.locations().count(true).await.unwrap(), 3);
    assert_eq!(h.lease.outstanding(), 0);
}

#[tokio::test]
async fn refreshed_token_retries_batch_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/locations"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/locations"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh"})))
        .mount(&server)
        .await;

    let h = harness(http_config(&server)).await;
    let auth = AuthorizationConfig {
        access_token: "stale".into(),
        refresh_token: "r".into(),
        refresh_url: format!("{}/token", server.uri()),
        refresh_payload: BTreeMap::from([("refresh_token".into(), REFRESH_TOKEN_PLACEHOLDER.into())]),
        ..Default::default()
    };
    h.dispatcher
        .set_authorization(Some(Arc::new(TokenAuthorization::new(
            auth,
            Client::new(),
            Arc::clone(&h.events),
        ))))
        .await;
    persist(&h.db, 2).await;

    let outcome = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap();
    assert_eq!(outcome, FlushOutcome::Synced { count: 2 });
    assert_eq!(h.db.locations().count(false).await.unwrap(), 0);
}

#[tokio::test]
async fn server_error_unlocks_and_carries_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad payload"))
        .mount(&server)
        .await;

    let h = harness(http_config(&server)).await;
    persist(&h.db, 2).await;

    let err = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap_err();
    match err {
        SyncError::HttpResponse { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, "bad payload");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.db.locations().count(true).await.unwrap(), 2);
    assert!(!h.http_events.lock().unwrap()[0].success);
}

#[tokio::test]
async fn transport_failure_is_network_error() {
    // Nothing listens on the reserved port.
    let config = HttpConfig {
        url: "http://127.0.0.1:9/locations".into(),
        http_timeout_secs: 2,
        ..Default::default()
    };
    let h = harness(config).await;
    persist(&h.db, 1).await;

    let err = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
    assert!(err.is_retryable());
    assert_eq!(h.db.locations().count(true).await.unwrap(), 1);
}

#[tokio::test]
async fn offline_flush_leaves_records_untouched() {
    let server = MockServer::start().await;
    let h = harness(http_config(&server)).await;
    persist(&h.db, 2).await;
    h.connectivity.set(false);

    let err = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap_err();
    assert!(matches!(err, SyncError::NoConnection));
    assert_eq!(h.db.locations().count(true).await.unwrap(), 2);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn autonomous_trigger_fires_once_threshold_is_reached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.auto_sync_threshold = 5;
    let h = harness(config).await;
    persist(&h.db, 4).await;

    let outcome = h.dispatcher.flush(FlushTrigger::Persisted).await.unwrap();
    assert_eq!(outcome, FlushOutcome::BelowThreshold { pending: 4 });

    // Exactly at the threshold counts.
    persist(&h.db, 1).await;
    let outcome = h.dispatcher.flush(FlushTrigger::Persisted).await.unwrap();
    assert_eq!(outcome, FlushOutcome::Synced { count: 5 });
}

#[tokio::test]
async fn explicit_flush_ignores_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.auto_sync_threshold = 5;
    let h = harness(config).await;
    persist(&h.db, 3).await;

    let outcome = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap();
    assert_eq!(outcome, FlushOutcome::Synced { count: 3 });
}

/// Polls until `count(true)` equals `expected`, for up to 2 s.
async fn wait_for_unlocked(db: &Database, expected: i64) -> bool {
    for _ in 0..200 {
        if db.locations().count(true).await.unwrap() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_until_busy(dispatcher: &SyncDispatcher) {
    for _ in 0..200 {
        if dispatcher.is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("flush never started");
}

#[tokio::test]
async fn flush_while_in_flight_is_coalesced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let h = harness(http_config(&server)).await;
    persist(&h.db, 3).await;

    let dispatcher = Arc::clone(&h.dispatcher);
    let first = tokio::spawn(async move { dispatcher.flush(FlushTrigger::Explicit).await });
    wait_until_busy(&h.dispatcher).await;
    assert!(wait_for_unlocked(&h.db, 0).await);

    let second = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap();
    assert_eq!(second, FlushOutcome::Busy);

    // Records persisted mid-flight stay unlocked until the next flush.
    persist(&h.db, 1).await;
    let second = h.dispatcher.flush(FlushTrigger::Persisted).await.unwrap();
    assert_eq!(second, FlushOutcome::Busy);
    assert_eq!(h.db.locations().count(true).await.unwrap(), 1);

    let first = first.await.unwrap().unwrap();
    let requests = server.received_requests().await.unwrap();
    let first_body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(first_body["locations"].as_array().unwrap().len(), 3);
    // The explicit drain picks up the late record in a second request.
    assert_eq!(first, FlushOutcome::Synced { count: 4 });
    assert_eq!(requests.len(), 2);
    assert!(!h.dispatcher.is_busy());
}

#[tokio::test]
async fn aborted_flush_unlocks_its_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let h = harness(http_config(&server)).await;
    persist(&h.db, 3).await;

    let dispatcher = Arc::clone(&h.dispatcher);
    let task = tokio::spawn(async move { dispatcher.flush(FlushTrigger::Explicit).await });
    wait_until_busy(&h.dispatcher).await;
    assert!(wait_for_unlocked(&h.db, 0).await, "batch was never locked");

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(wait_for_unlocked(&h.db, 3).await, "abandoned batch stayed locked");
    assert_eq!(h.db.locations().count(false).await.unwrap(), 3);
    assert!(!h.dispatcher.is_busy());
    assert_eq!(h.lease.outstanding(), 0);
}

#[tokio::test]
async fn explicit_flush_drains_in_batches() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.max_batch_size = 2;
    config.method = geotrack_sync::HttpMethod::Put;
    let h = harness(config).await;
    persist(&h.db, 5).await;

    let outcome = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap();
    assert_eq!(outcome, FlushOutcome::Synced { count: 5 });
    let counts: Vec<usize> = h.http_events.lock().unwrap().iter().map(|e| e.count).collect();
    assert_eq!(counts, vec![2, 2, 1]);
}

#[tokio::test]
async fn single_mode_sends_one_record_per_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"event": "tracking"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = http_config(&server);
    config.batch_sync = false;
    let h = harness(config).await;
    persist(&h.db, 3).await;

    let outcome = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap();
    assert_eq!(outcome, FlushOutcome::Synced { count: 3 });
    assert_eq!(h.db.locations().count(false).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_store_is_a_noop() {
    let server = MockServer::start().await;
    let h = harness(http_config(&server)).await;

    let outcome = h.dispatcher.flush(FlushTrigger::Explicit).await.unwrap();
    assert_eq!(outcome, FlushOutcome::Empty);
    assert!(server.received_requests().await.unwrap().is_empty());
}
