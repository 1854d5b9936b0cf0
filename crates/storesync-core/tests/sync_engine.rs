//! End-to-end tests for the sync engine
//!
//! Each test drives one or more engines through their public API with a
//! fake full-sync service and in-process transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use storesync_core::sync::{MessageKind, SyncMessage};
use storesync_core::{
    BroadcastHub, CacheHub, CollectionName, DeviceId, FullSyncDocument, MemoryRelay,
    PullOutcome, PullTrigger, PushOutcome, Storage, SyncConfig, SyncEngine, SyncEvent,
    SyncSnapshot,
};

fn snapshot(pairs: &[(CollectionName, serde_json::Value)]) -> SyncSnapshot {
    SyncSnapshot {
        collections: pairs.iter().cloned().collect(),
        timestamp: 1,
    }
}

// ============================================================================
// Merge properties through pulls
// ============================================================================

/// Applying the same snapshot twice leaves the same state
#[tokio::test]
async fn test_pull_is_idempotent() {
    let client = FakeSyncClient::new();
    client.serve(FullSyncDocument {
        partners: Some(json!([partner("P1"), partner("P2")])),
        settings: Some(json!({ "currency": "EUR" })),
        ..Default::default()
    });
    let engine = engine_with_client(&client);

    let first = engine.pull_now().await.unwrap();
    assert_eq!(
        first,
        PullOutcome::Applied(vec![CollectionName::Partners, CollectionName::Settings])
    );
    let after_first = engine
        .store()
        .snapshot(CollectionName::ALL)
        .collections;

    let second = engine.pull_now().await.unwrap();
    assert_eq!(second, PullOutcome::Applied(vec![]));
    assert_eq!(
        engine.store().snapshot(CollectionName::ALL).collections,
        after_first
    );
}

/// Scenario: server returns `partners: []` while three partners exist locally
#[tokio::test]
async fn test_empty_server_collection_keeps_local_records() {
    let client = FakeSyncClient::new();
    client.serve(FullSyncDocument {
        partners: Some(json!([])),
        ..Default::default()
    });
    let engine = engine_with_client(&client);
    for id in ["P1", "P2", "P3"] {
        engine
            .store()
            .upsert_record(CollectionName::Partners, partner(id))
            .unwrap();
    }
    let before = engine.store().get(CollectionName::Partners);

    let outcome = engine.pull_now().await.unwrap();

    assert_eq!(outcome, PullOutcome::Applied(vec![]));
    assert_eq!(engine.store().len(CollectionName::Partners), 3);
    assert_eq!(engine.store().get(CollectionName::Partners), before);
}

/// Partners added offline survive a pull that lacks them and still go out
#[tokio::test(start_paused = true)]
async fn test_local_only_partners_survive_pull_and_are_pushed() {
    let client = FakeSyncClient::new();
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();
    engine.start().await.unwrap();
    settle(Duration::from_millis(10)).await;

    engine
        .store()
        .upsert_record(CollectionName::Partners, partner("P1"))
        .unwrap();
    settle(Duration::from_millis(10)).await;
    assert_eq!(engine.pending_collections(), vec![CollectionName::Partners]);

    client.serve(FullSyncDocument {
        partners: Some(json!([partner("P2")])),
        ..Default::default()
    });
    assert_eq!(
        engine.pull_now().await.unwrap(),
        PullOutcome::Applied(vec![CollectionName::Partners])
    );
    assert_eq!(engine.store().len(CollectionName::Partners), 2);
    assert_eq!(engine.pending_collections(), vec![CollectionName::Partners]);

    wait_for(&mut events, |e| matches!(e, SyncEvent::Pushed { .. })).await;
    let pushed = client.pushes().last().cloned().unwrap();
    let ids: Vec<_> = pushed
        .partners
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].clone())
        .collect();
    assert!(ids.contains(&json!("P1")));
    assert!(ids.contains(&json!("P2")));
    assert!(engine.pending_collections().is_empty());

    assert_eq!(engine.pull_now().await.unwrap(), PullOutcome::Applied(vec![]));
    assert!(engine.pending_collections().is_empty());

    engine.shutdown().await;
}

/// The protected admin record survives a snapshot that omits it
#[tokio::test]
async fn test_pull_preserves_protected_identity() {
    let client = FakeSyncClient::new();
    client.serve(FullSyncDocument {
        staff: Some(json!([{ "id": 2, "username": "maria" }])),
        ..Default::default()
    });
    let engine = engine_with_client(&client);
    engine
        .store()
        .set_local(CollectionName::Staff, json!([admin()]))
        .unwrap();

    engine.pull_now().await.unwrap();

    let staff = engine.store().get(CollectionName::Staff);
    let records = staff.as_array().unwrap();
    let admins = records
        .iter()
        .filter(|r| r["username"] == "admin")
        .count();
    assert_eq!(admins, 1);
    assert_eq!(records[0]["username"], "admin");
    assert!(records.iter().any(|r| r["username"] == "maria"));
}

/// A malformed collection is skipped while the others still apply
#[tokio::test]
async fn test_malformed_collection_is_rejected_alone() {
    let client = FakeSyncClient::new();
    client.serve(FullSyncDocument {
        products: Some(json!({ "not": "a list" })),
        feedback: Some(json!([{ "id": "F1", "text": "great" }])),
        ..Default::default()
    });
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();

    let outcome = engine.pull_now().await.unwrap();

    assert_eq!(outcome, PullOutcome::Applied(vec![CollectionName::Feedback]));
    assert_eq!(engine.store().len(CollectionName::Products), 0);
    let rejected = wait_for(&mut events, |e| matches!(e, SyncEvent::SyncError { .. })).await;
    assert_eq!(rejected.collection(), Some(CollectionName::Products));
}

// ============================================================================
// Failure reporting
// ============================================================================

/// Background pull failures stay silent; user pulls raise a notice
#[tokio::test]
async fn test_only_user_pull_failure_is_announced() {
    let client = FakeSyncClient::new();
    client.set_failing(true);
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::SyncError { .. })).await;
    settle(Duration::from_millis(50)).await;
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::UserNotice { .. })));
    assert!(engine.status().last_error.is_some());

    assert!(engine.pull_now().await.is_err());
    wait_for(&mut events, |e| matches!(e, SyncEvent::UserNotice { .. })).await;

    client.set_failing(false);
    engine.pull_now().await.unwrap();
    let status = engine.status();
    assert!(status.last_error.is_none());
    assert!(status.last_sync_time.is_some());

    engine.shutdown().await;
}

// ============================================================================
// Debounced pushes
// ============================================================================

/// Many changes inside one window produce exactly one push
#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_is_pushed_once() {
    let client = FakeSyncClient::new();
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();
    engine.start().await.unwrap();
    settle(Duration::from_millis(10)).await;

    for id in ["P1", "P2", "P3", "P4"] {
        engine
            .store()
            .upsert_record(CollectionName::Partners, partner(id))
            .unwrap();
        settle(Duration::from_millis(300)).await;
    }
    engine
        .store()
        .set_local(CollectionName::Products, json!([{ "id": "SKU-1" }]))
        .unwrap();
    assert_eq!(client.push_count(), 0);

    let pushed = wait_for(&mut events, |e| matches!(e, SyncEvent::Pushed { .. })).await;
    assert_eq!(
        pushed,
        SyncEvent::Pushed {
            collections: vec![CollectionName::Partners, CollectionName::Products]
        }
    );

    settle(Duration::from_secs(10)).await;
    assert_eq!(client.push_count(), 1);
    let document = &client.pushes()[0];
    assert_eq!(document.partners.as_ref().unwrap().as_array().unwrap().len(), 4);
    assert_eq!(engine.status().pending_count, 0);

    engine.shutdown().await;
}

/// Scenario: adding P1 and waiting the window sends one partners message
#[tokio::test(start_paused = true)]
async fn test_single_record_push_message() {
    let hub = BroadcastHub::new();
    let engine = SyncEngine::builder(config(), Storage::in_memory().unwrap())
        .broadcast(hub.clone())
        .build()
        .unwrap();
    let mut wire = hub.subscribe();
    engine.start().await.unwrap();

    engine
        .store()
        .upsert_record(CollectionName::Partners, json!({ "id": "P1" }))
        .unwrap();
    settle(Duration::from_secs(5)).await;

    let mut messages = Vec::new();
    while let Ok(text) = wire.try_recv() {
        messages.push(SyncMessage::decode(&text).unwrap());
    }
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.kind, MessageKind::StateUpdate);
    assert_eq!(message.store, Some(CollectionName::Partners));
    assert_eq!(&message.source_device_id, engine.device_id());
    assert_eq!(message.payload, json!({ "partners": [{ "id": "P1" }] }));

    engine.shutdown().await;
}

/// A failed push keeps its collections pending and reports the error
#[tokio::test(start_paused = true)]
async fn test_failed_push_keeps_changes_pending() {
    let client = FakeSyncClient::new();
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();
    engine.start().await.unwrap();
    settle(Duration::from_millis(10)).await;

    client.set_failing(true);
    engine
        .store()
        .upsert_record(CollectionName::Distributors, json!({ "id": "D1" }))
        .unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::SyncError { .. })).await;
    assert_eq!(engine.pending_collections(), vec![CollectionName::Distributors]);
    assert!(engine.status().last_error.is_some());

    client.set_failing(false);
    assert_eq!(
        engine.push_now().await.unwrap(),
        PushOutcome::Pushed(CollectionName::ALL.to_vec())
    );
    assert!(engine.pending_collections().is_empty());

    engine.shutdown().await;
}

/// A failed push is retried on its own once the service recovers
#[tokio::test(start_paused = true)]
async fn test_failed_push_is_retried_without_new_edits() {
    let client = FakeSyncClient::new();
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();
    engine.start().await.unwrap();
    settle(Duration::from_millis(10)).await;

    client.set_failing(true);
    engine
        .store()
        .upsert_record(CollectionName::Distributors, json!({ "id": "D1" }))
        .unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::SyncError { .. })).await;
    assert!(engine.is_push_scheduled());

    client.set_failing(false);
    let pushed = wait_for(&mut events, |e| matches!(e, SyncEvent::Pushed { .. })).await;
    assert_eq!(
        pushed,
        SyncEvent::Pushed {
            collections: vec![CollectionName::Distributors]
        }
    );
    assert_eq!(client.push_count(), 1);
    assert!(client.pushes()[0].distributors.is_some());
    assert!(engine.pending_collections().is_empty());
    assert!(engine.status().last_error.is_none());

    engine.shutdown().await;
}

// ============================================================================
// Mutual exclusion
// ============================================================================

/// A push that comes due during a pull waits for it, then runs once
#[tokio::test(start_paused = true)]
async fn test_push_waits_for_in_flight_pull() {
    let client = FakeSyncClient::new();
    let release = client.hold_next_fetch();
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    settle(Duration::from_millis(10)).await;
    assert_eq!(client.log(), vec!["fetch-start"]);
    assert!(engine.status().sync_in_flight);

    engine
        .store()
        .upsert_record(CollectionName::Partners, partner("P1"))
        .unwrap();
    settle(Duration::from_secs(3)).await;
    assert_eq!(client.push_count(), 0, "push must not run during the pull");
    assert_eq!(engine.pending_collections(), vec![CollectionName::Partners]);

    assert_eq!(engine.pull_now().await.unwrap(), PullOutcome::Busy);
    assert_eq!(engine.push_now().await.unwrap(), PushOutcome::Busy);

    release.notify_one();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Pushed { .. })).await;

    assert_eq!(client.log(), vec!["fetch-start", "fetch-end", "push"]);
    assert!(!engine.status().sync_in_flight);

    engine.shutdown().await;
}

// ============================================================================
// Multi-device
// ============================================================================

fn relay_engine(relay: &Arc<MemoryRelay>, client: &Arc<FakeSyncClient>) -> SyncEngine {
    SyncEngine::builder(config(), Storage::in_memory().unwrap())
        .client(client.clone())
        .realtime(relay.clone())
        .build()
        .unwrap()
}

/// Scenario: A pushes a products update; B applies it, A does not
#[tokio::test(start_paused = true)]
async fn test_update_reaches_peer_not_sender() {
    let relay = Arc::new(MemoryRelay::new());
    let hub = BroadcastHub::new();
    let cache = CacheHub::new(Storage::in_memory().unwrap());
    let build = |hub: &Arc<BroadcastHub>| {
        SyncEngine::builder(config(), Storage::in_memory().unwrap())
            .realtime(relay.clone())
            .broadcast(hub.clone())
            .cache_hub(cache.clone())
            .build()
            .unwrap()
    };
    let a = build(&hub);
    let b = build(&hub);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for(&mut a_events, |e| matches!(e, SyncEvent::PeerJoined { .. })).await;
    // let the connect-time full-sync exchange finish first
    settle(Duration::from_millis(100)).await;

    let products = json!([{ "id": "SKU-1", "price": 12.5 }]);
    a.store()
        .set_local(CollectionName::Products, products.clone())
        .unwrap();

    let applied = wait_for(&mut b_events, |e| {
        matches!(e, SyncEvent::CollectionsApplied { .. })
    })
    .await;
    assert_eq!(
        applied,
        SyncEvent::CollectionsApplied {
            collections: vec![CollectionName::Products],
            source: Some(a.device_id().clone()),
        }
    );
    assert_eq!(b.store().get(CollectionName::Products), products);

    settle(Duration::from_secs(5)).await;
    assert!(!drain(&mut a_events)
        .iter()
        .any(|e| matches!(e, SyncEvent::CollectionsApplied { .. })));
    assert_eq!(a.status().peer_count, 1);

    a.shutdown().await;
    b.shutdown().await;
}

/// Applying a peer's update never schedules a push back
#[tokio::test(start_paused = true)]
async fn test_applied_update_is_not_echoed() {
    let relay = Arc::new(MemoryRelay::new());
    let client_a = FakeSyncClient::new();
    let client_b = FakeSyncClient::new();
    let a = relay_engine(&relay, &client_a);
    let b = relay_engine(&relay, &client_b);
    let mut b_events = b.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();
    settle(Duration::from_millis(50)).await;

    a.store()
        .set_local(CollectionName::Feedback, json!([{ "id": "F1", "stars": 5 }]))
        .unwrap();
    wait_for(&mut b_events, |e| {
        matches!(e, SyncEvent::CollectionsApplied { .. })
    })
    .await;
    assert!(!b.is_push_scheduled());
    assert!(b.pending_collections().is_empty());

    settle(Duration::from_secs(10)).await;
    assert_eq!(client_a.push_count(), 1);
    assert_eq!(client_b.push_count(), 0);
    assert!(!drain(&mut b_events)
        .iter()
        .any(|e| matches!(e, SyncEvent::Pushed { .. })));

    a.shutdown().await;
    b.shutdown().await;
}

/// A full push announces completion; peers pull the new snapshot
#[tokio::test(start_paused = true)]
async fn test_push_now_makes_peers_pull() {
    let relay = Arc::new(MemoryRelay::new());
    let server = FakeSyncClient::new();
    let a = relay_engine(&relay, &server);
    let b = relay_engine(&relay, &server);
    let mut b_events = b.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();
    settle(Duration::from_millis(50)).await;

    a.store()
        .set_local(CollectionName::Content, json!({ "banner": "Summer sale" }))
        .unwrap();
    a.push_now().await.unwrap();

    wait_for(&mut b_events, |e| {
        matches!(
            e,
            SyncEvent::Pulled {
                trigger: PullTrigger::RemoteNotification
            }
        )
    })
    .await;
    assert_eq!(
        b.store().get(CollectionName::Content),
        json!({ "banner": "Summer sale" })
    );

    a.shutdown().await;
    b.shutdown().await;
}

/// Orders are relayed to the other devices
#[tokio::test]
async fn test_order_notification_is_relayed() {
    let relay = Arc::new(MemoryRelay::new());
    let server = FakeSyncClient::new();
    let a = relay_engine(&relay, &server);
    let b = relay_engine(&relay, &server);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for(&mut a_events, |e| matches!(e, SyncEvent::PeerJoined { .. })).await;

    a.send_order(json!({ "orderId": "O-17", "total": 99 })).unwrap();

    let event = wait_for(&mut b_events, |e| {
        matches!(e, SyncEvent::OrderNotification { .. })
    })
    .await;
    assert_eq!(
        event,
        SyncEvent::OrderNotification {
            payload: json!({ "orderId": "O-17", "total": 99 })
        }
    );

    a.shutdown().await;
    b.shutdown().await;
}

/// An unreachable coordinating service degrades to local paths
#[tokio::test(start_paused = true)]
async fn test_offline_relay_falls_back_to_local_paths() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_available(false);
    let hub = BroadcastHub::new();
    let build = || {
        SyncEngine::builder(config(), Storage::in_memory().unwrap())
            .realtime(relay.clone())
            .broadcast(hub.clone())
            .build()
            .unwrap()
    };
    let a = build();
    let b = build();
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();
    let gave_up = wait_for(&mut a_events, |e| matches!(e, SyncEvent::SyncError { .. })).await;
    assert_eq!(gave_up.collection(), None);
    assert!(!a.status().connected);
    assert!(a.status().last_error.is_some());
    assert_eq!(relay.open_attempts(), 4);

    a.store()
        .upsert_record(CollectionName::Partners, partner("P9"))
        .unwrap();
    wait_for(&mut b_events, |e| {
        matches!(e, SyncEvent::CollectionsApplied { .. })
    })
    .await;
    assert_eq!(b.store().len(CollectionName::Partners), 1);

    a.shutdown().await;
    b.shutdown().await;
}

/// An edit made while the relay is down reaches the peer after reconnect
/// instead of being replaced by the peer's older full state
#[tokio::test(start_paused = true)]
async fn test_offline_edit_survives_reconnect() {
    let relay = Arc::new(MemoryRelay::new());
    let build = || {
        let config = SyncConfig {
            reconnect_attempts: 100,
            ..config()
        };
        SyncEngine::builder(config, Storage::in_memory().unwrap())
            .realtime(relay.clone())
            .build()
            .unwrap()
    };
    let a = build();
    let b = build();
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for(&mut a_events, |e| matches!(e, SyncEvent::PeerJoined { .. })).await;
    settle(Duration::from_millis(100)).await;

    let old = json!([{ "id": "SKU-1", "price": 10 }]);
    b.store()
        .set_local(CollectionName::Products, old.clone())
        .unwrap();
    wait_for(&mut a_events, |e| {
        matches!(e, SyncEvent::CollectionsApplied { .. })
    })
    .await;
    assert_eq!(a.store().get(CollectionName::Products), old);

    relay.set_available(false);
    relay.kick(a.device_id());
    settle(Duration::from_millis(50)).await;
    assert!(!a.status().connected);

    let new = json!([{ "id": "SKU-1", "price": 12 }]);
    a.store()
        .set_local(CollectionName::Products, new.clone())
        .unwrap();
    settle(Duration::from_secs(3)).await;
    assert_eq!(a.pending_collections(), vec![CollectionName::Products]);
    assert_eq!(b.store().get(CollectionName::Products), old);

    relay.set_available(true);
    let applied = wait_for(&mut b_events, |e| {
        matches!(e, SyncEvent::CollectionsApplied { source: Some(_), .. })
    })
    .await;
    assert_eq!(
        applied,
        SyncEvent::CollectionsApplied {
            collections: vec![CollectionName::Products],
            source: Some(a.device_id().clone()),
        }
    );
    settle(Duration::from_secs(1)).await;

    assert!(a.status().connected);
    assert_eq!(a.store().get(CollectionName::Products), new);
    assert_eq!(b.store().get(CollectionName::Products), new);
    assert!(a.pending_collections().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

/// A freshly started device replays the last cached broadcast
#[tokio::test(start_paused = true)]
async fn test_new_instance_replays_last_broadcast() {
    let cache = CacheHub::new(Storage::in_memory().unwrap());
    let a = SyncEngine::builder(config(), Storage::in_memory().unwrap())
        .cache_hub(cache.clone())
        .build()
        .unwrap();
    a.start().await.unwrap();
    a.store()
        .set_local(CollectionName::Settings, json!({ "currency": "EUR" }))
        .unwrap();
    settle(Duration::from_secs(5)).await;

    let late = SyncEngine::builder(config(), Storage::in_memory().unwrap())
        .cache_hub(cache.clone())
        .build()
        .unwrap();
    late.start().await.unwrap();

    assert_eq!(
        late.store().get(CollectionName::Settings),
        json!({ "currency": "EUR" })
    );

    a.shutdown().await;
    late.shutdown().await;
}

// ============================================================================
// Self-filtering and triggers
// ============================================================================

/// Messages carrying our own device id are dropped for every kind
#[tokio::test(start_paused = true)]
async fn test_own_messages_are_never_applied() {
    let hub = BroadcastHub::new();
    let engine = SyncEngine::builder(config(), Storage::in_memory().unwrap())
        .broadcast(hub.clone())
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    engine.start().await.unwrap();

    let own = engine.device_id().clone();
    let data = snapshot(&[(CollectionName::Products, json!([{ "id": "X" }]))]);
    for message in [
        SyncMessage::state_update(&own, &data),
        SyncMessage::full_sync(&own, &data),
        SyncMessage::full_sync_completed(&own),
        SyncMessage::request_sync(&own),
    ] {
        hub.publish(message.encode().unwrap());
    }
    settle(Duration::from_secs(5)).await;
    assert_eq!(engine.store().len(CollectionName::Products), 0);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::CollectionsApplied { .. })));

    let peer = DeviceId::from_string("device_peer");
    hub.publish(SyncMessage::state_update(&peer, &data).encode().unwrap());
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::CollectionsApplied { .. })
    })
    .await;
    assert_eq!(engine.store().len(CollectionName::Products), 1);

    engine.shutdown().await;
}

/// A local sync request is answered with our full state
#[tokio::test(start_paused = true)]
async fn test_local_sync_request_is_answered() {
    let hub = BroadcastHub::new();
    let engine = SyncEngine::builder(config(), Storage::in_memory().unwrap())
        .broadcast(hub.clone())
        .build()
        .unwrap();
    engine
        .store()
        .set_local(CollectionName::Partners, json!([partner("P1")]))
        .unwrap();
    engine.start().await.unwrap();
    let mut wire = hub.subscribe();

    let peer = DeviceId::from_string("device_peer");
    hub.publish(SyncMessage::request_sync(&peer).encode().unwrap());
    settle(Duration::from_millis(100)).await;

    let reply = std::iter::from_fn(|| wire.try_recv().ok())
        .filter_map(|text| SyncMessage::decode(&text).ok())
        .find(|m| m.kind == MessageKind::FullSync)
        .expect("full sync reply");
    assert_eq!(&reply.source_device_id, engine.device_id());
    assert_eq!(reply.payload["partners"], json!([partner("P1")]));

    engine.shutdown().await;
}

/// Regaining visibility triggers a pull
#[tokio::test(start_paused = true)]
async fn test_visibility_regained_pulls() {
    let client = FakeSyncClient::new();
    let engine = engine_with_client(&client);
    let mut events = engine.subscribe();
    engine.start().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            SyncEvent::Pulled {
                trigger: PullTrigger::Startup
            }
        )
    })
    .await;

    engine.set_visible(true);
    engine.set_visible(false);
    settle(Duration::from_millis(50)).await;
    assert_eq!(client.fetch_count(), 1);

    engine.set_visible(true);
    wait_for(&mut events, |e| {
        matches!(
            e,
            SyncEvent::Pulled {
                trigger: PullTrigger::VisibilityRegained
            }
        )
    })
    .await;
    assert_eq!(client.fetch_count(), 2);

    engine.shutdown().await;
}

/// Records are mirrored to the per-record endpoints
#[tokio::test]
async fn test_record_edits_call_record_endpoints() {
    let client = FakeSyncClient::new();
    let engine = engine_with_client(&client);

    engine
        .save_record(CollectionName::Partners, partner("P1"))
        .await
        .unwrap();
    assert!(engine
        .delete_record(CollectionName::Partners, &json!("P1"))
        .await
        .unwrap());

    assert_eq!(
        client.record_calls(),
        vec!["PUT /api/partners/P1", "DELETE /api/partners/P1"]
    );
    assert_eq!(engine.store().len(CollectionName::Partners), 0);
}

/// A failing record endpoint never rolls back the local edit
#[tokio::test]
async fn test_record_endpoint_failure_keeps_local_edit() {
    let client = FakeSyncClient::new();
    client.set_failing(true);
    let engine = engine_with_client(&client);

    engine
        .save_record(CollectionName::Partners, partner("P1"))
        .await
        .unwrap();
    assert_eq!(engine.store().len(CollectionName::Partners), 1);
}
