//! End-to-end field scenarios: engine, HTTP client and a mock API server

use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::sync::{BackoffPolicy, CoordinatorConfig};
use fieldsync_core::{
    CacheError, Engine, EntityKind, HttpProbe, HttpRemote, MemoryStore, MutationStatus,
    NetworkMonitor, SubmitError, SystemClock,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine(server: &MockServer, online: bool) -> Engine<HttpRemote, HttpProbe> {
    let remote = HttpRemote::new(server.uri(), Duration::from_secs(5)).unwrap();
    Engine::new(
        Arc::new(MemoryStore::new()),
        remote,
        Arc::new(NetworkMonitor::new(online)),
        Arc::new(true),
        Arc::new(SystemClock),
        CoordinatorConfig {
            backoff: BackoffPolicy {
                initial: Duration::from_millis(50),
                multiplier: 2,
                max: Duration::from_millis(200),
            },
            ..CoordinatorConfig::default()
        },
    )
    .unwrap()
}

async fn posted_names(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).unwrap();
            body["name"].as_str().unwrap_or_default().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_three_offline_attendees_post_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/attendees"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 1 })))
        .expect(3)
        .mount(&server)
        .await;

    let engine = engine(&server, false);
    for name in ["Amina", "Bilal", "Chaman"] {
        engine
            .submit(EntityKind::Attendee, json!({ "name": name, "session_id": "s-1" }), false)
            .unwrap();
    }
    assert_eq!(engine.queue().list().unwrap().len(), 3);

    engine.network().report(true);
    let report = engine.drain().await.unwrap();

    assert_eq!(report.synced.len(), 3);
    assert!(engine.queue().list().unwrap().is_empty());
    assert_eq!(posted_names(&server).await, vec!["Amina", "Bilal", "Chaman"]);
}

#[tokio::test]
async fn test_server_error_retries_same_item_first() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "database busy" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 2 })))
        .mount(&server)
        .await;

    let engine = engine(&server, true);
    let first = engine
        .submit(EntityKind::Attendee, json!({ "name": "First", "session_id": "s-1" }), false)
        .unwrap();
    engine
        .submit(EntityKind::Attendee, json!({ "name": "Second", "session_id": "s-1" }), false)
        .unwrap();

    let report = engine.drain().await.unwrap();
    assert!(report.backoff.is_some());
    let item = engine.queue().get(first).unwrap().unwrap();
    assert_eq!(item.status, MutationStatus::Pending);
    assert!(item.last_error.unwrap().contains("database busy"));

    let report = engine.drain().await.unwrap();
    assert_eq!(report.synced.len(), 2);
    assert_eq!(posted_names(&server).await, vec!["First", "First", "Second"]);
}

#[tokio::test]
async fn test_background_engine_recovers_after_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 3 })))
        .mount(&server)
        .await;

    let engine = engine(&server, true);
    let mut summary = engine.queue().subscribe();
    engine.init().await;

    engine
        .submit(EntityKind::Session, json!({ "name": "Clinic day" }), false)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), summary.wait_for(|s| s.total() == 0))
        .await
        .expect("queue should drain after backoff")
        .unwrap();
    assert_eq!(posted_names(&server).await.len(), 3);

    engine.dispose().await;
}

#[tokio::test]
async fn test_rejected_item_does_not_block_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/screenings"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "message": "invalid date" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/location-updates"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 4 })))
        .mount(&server)
        .await;

    let engine = engine(&server, true);
    let bad = engine
        .submit(EntityKind::Screening, json!({ "name": "Gul", "date": "yesterday" }), false)
        .unwrap();
    let good = engine
        .submit(EntityKind::LocationUpdate, json!({ "lat": 34.5, "lng": 69.1 }), false)
        .unwrap();

    let report = engine.drain().await.unwrap();
    assert_eq!(report.failed, vec![bad]);
    assert_eq!(report.synced, vec![good]);

    let failed = engine.queue().get(bad).unwrap().unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert_eq!(engine.status().current().failed_count, 1);
}

#[tokio::test]
async fn test_cached_sessions_served_offline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "s-1" }])))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine(&server, true);
    let online = engine.fetch("/api/sessions").await.unwrap();

    engine.network().report(false);
    let offline = engine.fetch("/api/sessions").await.unwrap();
    assert_eq!(online, offline);

    let miss = engine.fetch("/api/screenings").await.unwrap_err();
    assert!(matches!(miss, CacheError::NoCachedData { .. }));
}

#[tokio::test]
async fn test_repeat_screening_prompts_duplicate() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);

    let payload = json!({ "name": "Ali Gul", "father": "Noor Hasan", "session_id": "scr-12" });
    engine.submit(EntityKind::Screening, payload.clone(), false).unwrap();

    let err = engine
        .submit(EntityKind::Screening, payload.clone(), false)
        .unwrap_err();
    assert!(matches!(err, SubmitError::LikelyDuplicate { .. }));

    engine.submit(EntityKind::Screening, payload, true).unwrap();
    assert_eq!(engine.queue().list().unwrap().len(), 2);
}

#[tokio::test]
async fn test_queue_survives_restart_on_disk() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 5 })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = dir.path().join("fieldsync.db");
    let open = |online: bool| {
        let store = fieldsync_core::storage::SqliteStore::open(&db).unwrap();
        Engine::<HttpRemote, HttpProbe>::new(
            Arc::new(store),
            HttpRemote::new(server.uri(), Duration::from_secs(5)).unwrap(),
            Arc::new(NetworkMonitor::new(online)),
            Arc::new(true),
            Arc::new(SystemClock),
            CoordinatorConfig::default(),
        )
        .unwrap()
    };

    {
        let engine = open(false);
        engine
            .submit(EntityKind::Attendee, json!({ "name": "Persisted", "session_id": "s-1" }), false)
            .unwrap();
    }

    let engine = open(true);
    assert_eq!(engine.queue().list().unwrap().len(), 1);
    engine.drain().await.unwrap();
    assert!(engine.queue().list().unwrap().is_empty());
    assert_eq!(posted_names(&server).await, vec!["Persisted"]);
}
