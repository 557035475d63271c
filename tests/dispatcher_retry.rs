//! Dispatcher delivery-policy tests: retry budget, backoff spacing,
//! terminal statuses, header contract, and secondary fan-out isolation.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wagate::dispatch::{DispatchError, ForwardMeta, WebhookDispatcher};
use wagate::store::ConfigStore;

fn config(dir: &TempDir, default_url: Option<String>) -> Arc<ConfigStore> {
    Arc::new(ConfigStore::load(dir.path().join("contacts.json"), default_url).unwrap())
}

fn meta(entity_type: Option<&str>) -> ForwardMeta {
    ForwardMeta {
        source_id: "972500000002".into(),
        source_type: "contact".into(),
        entity_type: entity_type.map(str::to_string),
        event_kind: "MESSAGES_UPSERT".into(),
    }
}

/// 503, 503, then 200: exactly three attempts with the 1 s / 2 s backoff
/// schedule, ending in success and clean health.
#[tokio::test]
async fn retry_then_success_uses_full_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let dispatcher = WebhookDispatcher::new(config(&dir, Some(url.clone())), None, "wagate".into());

    let started = Instant::now();
    let success = dispatcher
        .forward(&json!({"key": {"id": "M1"}}), &meta(None))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(success.attempt, 3);
    assert_eq!(success.destination, url);
    // Backoff delays of 1 s then 2 s must have elapsed between attempts.
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    assert_eq!(dispatcher.consecutive_failures(&url), 0);
    let health = dispatcher.health();
    assert!(health.destinations.get(&url).unwrap().last_success.is_some());
}

/// A 4xx is terminal: one request, no retries, failure recorded.
#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let dispatcher = WebhookDispatcher::new(config(&dir, Some(url.clone())), None, "wagate".into());

    let err = dispatcher
        .forward(&json!({"x": 1}), &meta(None))
        .await
        .unwrap_err();
    match err {
        DispatchError::Terminal { status, .. } => assert_eq!(status, 404),
        other => panic!("expected Terminal, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(dispatcher.consecutive_failures(&url), 1);
}

/// Persistent 5xx exhausts the budget: three requests, then a typed
/// failure carrying the destination's failure count.
#[tokio::test]
async fn persistent_server_error_exhausts_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let dispatcher = WebhookDispatcher::new(config(&dir, Some(url.clone())), None, "wagate".into());

    let err = dispatcher
        .forward(&json!({"x": 1}), &meta(None))
        .await
        .unwrap_err();
    match err {
        DispatchError::Exhausted {
            attempts,
            last_status,
            consecutive_failures,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_status, Some(500));
            assert_eq!(consecutive_failures, 1);
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

/// The exact inbound body is POSTed unchanged, with the full routing
/// header set.
#[tokio::test]
async fn forward_carries_headers_and_unchanged_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let dispatcher = WebhookDispatcher::new(config(&dir, Some(url)), None, "gateway-1".into());

    let payload = json!({"key": {"remoteJid": "972500000002@s.whatsapp.net"}, "message": {"conversation": "hi"}});
    dispatcher
        .forward(&payload, &meta(Some("VIP")))
        .await
        .unwrap();

    let request = &server.received_requests().await.unwrap()[0];
    let header = |name: &str| {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    assert_eq!(header("content-type"), "application/json");
    assert_eq!(header("x-filter-source"), "gateway-1");
    assert_eq!(header("x-source-id"), "972500000002");
    assert_eq!(header("x-source-type"), "contact");
    assert_eq!(header("x-entity-type"), "VIP");
    assert_eq!(header("x-event-type"), "MESSAGES_UPSERT");

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body, payload);
}

/// Type routes resolve ahead of the default destination.
#[tokio::test]
async fn type_route_receives_instead_of_default() {
    let default_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&default_server)
        .await;
    let vip_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&vip_server)
        .await;

    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, Some(format!("{}/d", default_server.uri())));
    let mut routes = HashMap::new();
    routes.insert("VIP".to_string(), format!("{}/vip", vip_server.uri()));
    cfg.set_type_webhooks(routes).unwrap();

    let dispatcher = WebhookDispatcher::new(cfg, None, "wagate".into());
    let success = dispatcher
        .forward(&json!({"x": 1}), &meta(Some("VIP")))
        .await
        .unwrap();
    assert!(success.destination.ends_with("/vip"));
}

/// The secondary destination gets a copy, but its failures never block
/// or fail the primary, and never trigger primary retries.
#[tokio::test]
async fn secondary_failure_does_not_affect_primary() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&primary)
        .await;
    let secondary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&secondary)
        .await;

    let dir = TempDir::new().unwrap();
    let dispatcher = WebhookDispatcher::new(
        config(&dir, Some(format!("{}/p", primary.uri()))),
        Some(format!("{}/s", secondary.uri())),
        "wagate".into(),
    );

    let started = Instant::now();
    let success = dispatcher
        .forward(&json!({"x": 1}), &meta(None))
        .await
        .unwrap();
    assert_eq!(success.attempt, 1);
    // Primary must not have waited on the slow secondary.
    assert!(started.elapsed() < Duration::from_millis(150));

    // Give the fire-and-forget task time to reach the secondary.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(secondary.received_requests().await.unwrap().len(), 1);
    assert_eq!(primary.received_requests().await.unwrap().len(), 1);
}

/// The synthetic test probe posts the documented shape and updates
/// destination health like a normal delivery.
#[tokio::test]
async fn test_probe_shape_and_health() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/hook", server.uri());
    let dispatcher = WebhookDispatcher::new(config(&dir, Some(url.clone())), None, "wagate".into());

    let outcome = dispatcher.test(Some("VIP")).await;
    assert!(outcome.success);
    assert_eq!(outcome.destination.as_deref(), Some(url.as_str()));

    let request = &server.received_requests().await.unwrap()[0];
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body.get("test"), Some(&json!(true)));
    assert!(body.get("timestamp").is_some());
    assert_eq!(body.get("entityType"), Some(&json!("VIP")));

    let health = dispatcher.health();
    assert!(health.destinations.get(&url).unwrap().last_success.is_some());
}
