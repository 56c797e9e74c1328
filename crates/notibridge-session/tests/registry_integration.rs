#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the session registry.
//!
//! Drives full device sessions against in-memory transports: login,
//! ingestion, filtering, backoff, manual control and request routing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

use notibridge_core::filter::{RULE_PACKAGE_BLACKLIST, RULE_PACKAGE_WHITELIST, default_rules};
use notibridge_core::{
    Config, Device, DeviceStore, FilterConfigStore, MemoryDeviceStore, MemoryFilterStore,
    RuleUpdate,
};
use notibridge_session::{
    ConnectionState, CorrelatorError, DeviceView, MemoryConnector, MemoryPeer, SessionError,
    SessionEvent, SessionRegistry, SessionStatus,
};

const WAIT: Duration = Duration::from_secs(600);

struct Fixture {
    registry: SessionRegistry<Arc<MemoryConnector>>,
    connector: Arc<MemoryConnector>,
    peers: UnboundedReceiver<(String, MemoryPeer)>,
    devices: Arc<MemoryDeviceStore>,
    filters: Arc<MemoryFilterStore>,
}

fn fixture(devices: Vec<Device>, config: Config) -> Fixture {
    let (connector, peers) = MemoryConnector::new();
    let devices = Arc::new(MemoryDeviceStore::with_devices(devices));
    let filters = Arc::new(MemoryFilterStore::new());
    let registry = SessionRegistry::new(
        Arc::clone(&connector),
        Arc::clone(&devices) as Arc<dyn DeviceStore>,
        Arc::clone(&filters) as Arc<dyn FilterConfigStore>,
        config,
    )
    .unwrap();
    Fixture {
        registry,
        connector,
        peers,
        devices,
        filters,
    }
}

fn device(uuid: &str, endpoint: &str, token: Option<&str>) -> Device {
    Device::new(uuid, "pixel", endpoint, token.map(String::from))
}

async fn next_frame(peer: &mut MemoryPeer) -> Value {
    serde_json::from_str(&peer.recv().await.unwrap()).unwrap()
}

/// Accept the next connection and answer its login.
async fn accept(fx: &mut Fixture, success: bool) -> (String, MemoryPeer, Value) {
    let (endpoint, mut peer) = fx.peers.recv().await.unwrap();
    let login = next_frame(&mut peer).await;
    assert_eq!(login["action"], "login");
    let answer = if success {
        json!({"requestId": login["requestId"], "success": true})
    } else {
        json!({"requestId": login["requestId"], "success": false, "message": "invalid token"})
    };
    peer.send(answer.to_string()).await;
    (endpoint, peer, login)
}

async fn wait_status(
    fx: &Fixture,
    uuid: &str,
    pred: impl FnMut(&SessionStatus) -> bool,
) -> SessionStatus {
    let mut rx = fx.registry.handle(uuid).await.unwrap().watch_status();
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .unwrap()
        .unwrap()
        .clone()
}

async fn wait_view(
    fx: &Fixture,
    uuid: &str,
    mut pred: impl FnMut(&DeviceView) -> bool,
) -> Arc<DeviceView> {
    let mut rx = fx.registry.handle(uuid).await.unwrap().watch_view();
    tokio::time::timeout(WAIT, rx.wait_for(|v| pred(v)))
        .await
        .unwrap()
        .unwrap()
        .clone()
}

fn visible_ids(view: &DeviceView) -> Vec<&str> {
    view.visible.iter().map(|n| n.id.as_str()).collect()
}

fn note(package: &str, id: u32, action: &str) -> Value {
    json!({"packageName": package, "id": id, "action": action, "title": "t", "text": "body"})
}

fn push(notification: Value) -> String {
    json!({"type": "notification", "notification": notification}).to_string()
}

// =========================================================================
// Session flow
// =========================================================================

#[tokio::test]
async fn login_initial_sync_and_lifecycle_events() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    assert_eq!(fx.registry.start().await.unwrap(), 1);

    let (endpoint, peer, login) = accept(&mut fx, true).await;
    assert_eq!(endpoint, "mem://a");
    assert_eq!(login["token"], "T");
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;

    let initial = json!({
        "type": "initial",
        "data": [note("com.chat", 1, "init"), note("com.chat", 2, "init"), note("com.chat", 3, "init")]
    });
    peer.send(initial.to_string()).await;
    peer.send(push(note("com.chat", 4, "posted"))).await;
    peer.send(push(json!({"packageName": "com.chat", "id": 2, "action": "removed"})))
        .await;

    let view = wait_view(&fx, "dev-1", |v| visible_ids(v) == ["1", "3", "4"]).await;
    assert_eq!(view.counts.total, 3);
    assert_eq!(view.counts.unread, 3);

    let saved = fx.devices.load().unwrap();
    assert!(saved[0].last_used_at >= saved[0].created_at);
}

#[tokio::test]
async fn rule_update_refilters_every_device() {
    let mut fx = fixture(
        vec![
            device("dev-1", "mem://a", Some("T1")),
            device("dev-2", "mem://b", Some("T2")),
        ],
        Config::default(),
    );
    fx.registry.start().await.unwrap();

    for _ in 0..2 {
        let (_, peer, _) = accept(&mut fx, true).await;
        peer.send(push(note("com.ads.banner", 1, "posted"))).await;
        peer.send(push(note("com.chat", 2, "posted"))).await;
        // Keep the connection alive for the rest of the test.
        tokio::spawn(async move {
            let mut peer = peer;
            while peer.recv().await.is_some() {}
        });
    }
    for uuid in ["dev-1", "dev-2"] {
        wait_view(&fx, uuid, |v| v.visible.len() == 2).await;
    }

    let changed = fx
        .registry
        .update_rule(
            RULE_PACKAGE_BLACKLIST,
            &RuleUpdate {
                enabled: Some(true),
                patterns: Some(vec!["com.ads.*".into()]),
            },
        )
        .unwrap();
    assert!(changed);

    for uuid in ["dev-1", "dev-2"] {
        let view = wait_view(&fx, uuid, |v| visible_ids(v) == ["2"]).await;
        assert_eq!(view.notifications.len(), 2);
        assert_eq!(view.counts.total, 1);
    }
    let saved = fx.filters.load().unwrap();
    assert!(saved.iter().any(|r| r.id == RULE_PACKAGE_BLACKLIST && r.enabled));
}

#[tokio::test]
async fn replacing_rules_keeps_one_package_rule() {
    let fx = fixture(Vec::new(), Config::default());
    fx.registry
        .update_rule(
            RULE_PACKAGE_BLACKLIST,
            &RuleUpdate {
                enabled: Some(true),
                patterns: None,
            },
        )
        .unwrap();

    let mut rules = default_rules();
    for r in &mut rules {
        if r.package_filter.is_some() {
            r.enabled = true;
        }
    }
    fx.registry.set_rules(rules).unwrap();

    let current = fx.registry.rules();
    assert!(current.is_enabled(RULE_PACKAGE_WHITELIST));
    assert!(!current.is_enabled(RULE_PACKAGE_BLACKLIST));
    assert_eq!(fx.filters.load().unwrap(), current.rules());
}

// =========================================================================
// Reconnect and backoff
// =========================================================================

#[tokio::test(start_paused = true)]
async fn unreachable_device_backs_off_exponentially() {
    let fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    fx.connector.set_refusing(true);
    let mut events = fx.registry.subscribe();
    fx.registry.start().await.unwrap();

    let mut delays = Vec::new();
    while delays.len() < 6 {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let SessionEvent::StateChanged { status, .. } = event
            && let Some(delay) = status.retry_in_ms
        {
            assert_eq!(status.state, ConnectionState::Disconnected);
            delays.push(delay);
        }
    }
    assert_eq!(delays, [3000, 6000, 12000, 24000, 30000, 30000]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_fail_until_manual_reconnect() {
    let mut config = Config::default();
    config.reconnect.max_attempts = Some(2);
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], config);
    fx.connector.set_refusing(true);
    fx.registry.start().await.unwrap();

    let status = wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Failed).await;
    assert!(status.last_error.is_some());
    assert_eq!(fx.connector.attempts(), 3);

    let handle = fx.registry.handle("dev-1").await.unwrap();
    assert_eq!(
        handle.connect().await.unwrap_err(),
        SessionError::MaxAttemptsExceeded("dev-1".into())
    );

    fx.connector.set_refusing(false);
    fx.registry.reconnect("dev-1").await.unwrap();
    let _conn = accept(&mut fx, true).await;
    let status = wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;
    assert_eq!(status.reconnect_attempt, 0);
    assert!(status.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn connection_loss_reconnects_and_reconciles() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    fx.registry.start().await.unwrap();

    let (_, peer, _) = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;
    peer.send(push(note("com.chat", 1, "posted"))).await;
    wait_view(&fx, "dev-1", |v| v.visible.len() == 1).await;

    peer.close("wifi dropped").await;
    let status = wait_status(&fx, "dev-1", |s| s.retry_in_ms.is_some()).await;
    assert_eq!(status.retry_in_ms, Some(3000));
    assert!(status.last_error.unwrap().contains("wifi dropped"));

    let (_, peer, _) = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;
    let initial = json!({"type": "initial", "data": [note("com.chat", 1, "init"), note("com.chat", 5, "init")]});
    peer.send(initial.to_string()).await;

    wait_view(&fx, "dev-1", |v| visible_ids(v) == ["1", "5"]).await;
    assert_eq!(fx.connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_suppresses_reconnect() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    fx.registry.start().await.unwrap();
    let (_, peer, _) = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;

    fx.registry.disconnect("dev-1").await.unwrap();
    assert!(peer.is_closed());
    tokio::time::sleep(Duration::from_secs(300)).await;

    let status = fx.registry.status("dev-1").await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.manual_disconnect);
    assert!(status.last_error.is_none());
    assert_eq!(fx.connector.attempts(), 1);

    fx.registry.reconnect("dev-1").await.unwrap();
    let _conn = accept(&mut fx, true).await;
    let status = wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;
    assert!(!status.manual_disconnect);
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_is_reported_and_retried() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("old"))], Config::default());
    fx.registry.start().await.unwrap();
    let _first = accept(&mut fx, false).await;

    let status = wait_status(&fx, "dev-1", |s| s.retry_in_ms.is_some()).await;
    assert!(status.last_error.unwrap().contains("invalid token"));

    let (_, _peer, login) = accept(&mut fx, true).await;
    assert_eq!(login["token"], "old");
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;
}

// =========================================================================
// Device management
// =========================================================================

#[tokio::test]
async fn disable_stops_session_and_enable_restarts_it() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    fx.registry.start().await.unwrap();
    let (_, peer, _) = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;

    fx.registry.set_enabled("dev-1", false).await.unwrap();
    assert!(peer.is_closed());
    assert!(fx.registry.handle("dev-1").await.is_none());
    assert!(!fx.devices.load().unwrap()[0].enabled);

    fx.registry.set_enabled("dev-1", true).await.unwrap();
    let _conn = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;
    assert!(fx.devices.load().unwrap()[0].enabled);
}

#[tokio::test]
async fn adding_device_on_same_endpoint_replaces_it() {
    let fx = fixture(Vec::new(), Config::default());
    fx.registry
        .add_device(device("dev-1", "mem://a", None))
        .await
        .unwrap();
    fx.registry
        .add_device(device("dev-2", "mem://a", None))
        .await
        .unwrap();

    let devices = fx.registry.devices().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].uuid, "dev-2");
    assert!(fx.registry.handle("dev-1").await.is_none());
    assert_eq!(
        fx.registry.remove_device("dev-1").await.unwrap_err(),
        SessionError::DeviceNotFound("dev-1".into())
    );
}

#[tokio::test]
async fn pairing_then_token_update_enables_login() {
    let mut fx = fixture(Vec::new(), Config::default());
    fx.registry
        .add_device(device("dev-1", "mem://a", None))
        .await
        .unwrap();
    assert_eq!(
        fx.registry.status("dev-1").await.unwrap().state,
        ConnectionState::Idle
    );

    let pairing = tokio::spawn(async move {
        let (_, mut peer) = fx.peers.recv().await.unwrap();
        let req = next_frame(&mut peer).await;
        assert_eq!(req["action"], "request_token");
        let id = req["requestId"].clone();
        peer.send(json!({"requestId": id, "success": true, "pending": true}).to_string())
            .await;
        peer.send(json!({"requestId": id, "success": true, "token": "fresh"}).to_string())
            .await;
        fx.peers
    });
    let token = fx.registry.request_token("mem://a").await.unwrap();
    assert_eq!(token, "fresh");
    fx.peers = pairing.await.unwrap();

    fx.registry
        .update_token("dev-1", Some(token))
        .await
        .unwrap();
    assert_eq!(
        fx.devices.load().unwrap()[0].token.as_deref(),
        Some("fresh")
    );

    fx.registry.reconnect("dev-1").await.unwrap();
    let (_, _peer, login) = accept(&mut fx, true).await;
    assert_eq!(login["token"], "fresh");
}

// =========================================================================
// Request routing
// =========================================================================

#[tokio::test(start_paused = true)]
async fn request_timeout_then_late_response_is_ignored() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    fx.registry.start().await.unwrap();
    let (_, mut peer, _) = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;

    let handle = fx.registry.handle("dev-1").await.unwrap();
    let request = tokio::spawn(async move {
        handle
            .request("getApps", Value::Null, Some(Duration::from_secs(5)))
            .await
    });
    let frame = next_frame(&mut peer).await;
    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Request(CorrelatorError::Timeout { .. })
    ));

    peer.send(json!({"requestId": frame["requestId"], "success": true}).to_string())
        .await;
    peer.send(push(note("com.chat", 9, "posted"))).await;
    wait_view(&fx, "dev-1", |v| v.visible.len() == 1).await;
    assert_eq!(
        fx.registry.status("dev-1").await.unwrap().state,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn removing_device_rejects_outstanding_requests() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    fx.registry.start().await.unwrap();
    let (_, mut peer, _) = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;

    let handle = fx.registry.handle("dev-1").await.unwrap();
    let request = tokio::spawn(async move { handle.request("getApps", Value::Null, None).await });
    let _ = next_frame(&mut peer).await;

    fx.registry.remove_device("dev-1").await.unwrap();
    assert_eq!(
        request.await.unwrap().unwrap_err(),
        SessionError::Request(CorrelatorError::ConnectionClosed)
    );
    assert!(fx.devices.load().unwrap().is_empty());
    assert!(
        fx.registry
            .request("dev-1", "getApps", Value::Null, None)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn local_operations_route_through_registry() {
    let mut fx = fixture(vec![device("dev-1", "mem://a", Some("T"))], Config::default());
    fx.registry.start().await.unwrap();
    let (_, peer, _) = accept(&mut fx, true).await;
    wait_status(&fx, "dev-1", |s| s.state == ConnectionState::Connected).await;
    peer.send(push(note("com.chat", 1, "posted"))).await;
    peer.send(push(note("com.mail", 1, "posted"))).await;
    peer.send(push(note("com.chat", 2, "posted"))).await;
    wait_view(&fx, "dev-1", |v| v.counts.total == 3).await;

    assert!(fx.registry.mark_read("dev-1", vec!["2".into()]).await.unwrap());
    assert_eq!(fx.registry.view("dev-1").await.unwrap().counts.unread, 2);

    assert!(fx.registry.delete_notification("dev-1", "1").await.unwrap());
    let view = fx.registry.view("dev-1").await.unwrap();
    assert_eq!(visible_ids(&view), ["2"]);

    assert!(fx.registry.clear_notifications("dev-1").await.unwrap());
    assert_eq!(fx.registry.views().await[0].counts.total, 0);

    fx.registry.shutdown().await;
    assert!(fx.registry.handle("dev-1").await.is_none());
}
