//! Flows against a real Redis at `REDIS_URL`.
//!
//! Run with `cargo test -p eventbus --test redis_integration -- --ignored`.

use eventbus::{
    keys, router, BusConfig, Consumer, EmitOptions, Emitter, Event, LivenessTracker,
    PartitionCoordinator, Producer, RedisStore, Store,
};
use serde_json::json;
use serial_test::serial;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
}

/// Unique service/event names so runs never see each other's data.
fn test_prefix() -> String {
    format!("test:{}", Uuid::new_v4().simple())
}

async fn store() -> Store {
    Store::Redis(RedisStore::connect(&get_redis_url()).await.unwrap())
}

async fn cleanup(store: &Store, patterns: &[String]) {
    let Store::Redis(redis_store) = store else {
        return;
    };
    let mut conn = redis_store.connection();
    for pattern in patterns {
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        if !keys.is_empty() {
            let _: () = redis::cmd("DEL")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .unwrap_or(());
        }
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_emit_routes_by_crc32_of_key() {
    let store = store().await;
    let prefix = test_prefix();
    let service = format!("{prefix}:svc");
    let event_name = format!("{prefix}:orders:created");

    store
        .register_service(&service, 4, &[event_name.clone()])
        .await
        .unwrap();
    let event = Producer::new(store.clone(), "shop")
        .emit(&event_name, json!({"id": 1}), EmitOptions::new().key("customer-7"))
        .await
        .unwrap();

    let partition = router::partition_index(router::crc32(b"customer-7"), 4);
    let raw = store
        .peek_oldest(&keys::partition_queue(&service, partition))
        .await
        .unwrap()
        .expect("event in the keyed partition");
    assert_eq!(Event::decode(&raw).unwrap(), event);

    cleanup(&store, &[format!("{prefix}*")]).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_emit_fans_out_to_every_service() {
    let store = store().await;
    let prefix = test_prefix();
    let event_name = format!("{prefix}:tick");
    let services = [format!("{prefix}:a"), format!("{prefix}:b")];
    for service in &services {
        store
            .register_service(service, 1, &[event_name.clone()])
            .await
            .unwrap();
    }

    Producer::new(store.clone(), "shop")
        .emit(&event_name, json!(1), EmitOptions::new())
        .await
        .unwrap();

    for service in &services {
        let queue = keys::partition_queue(service, 0);
        assert_eq!(store.queue_len(&queue).await.unwrap(), 1);
    }
    cleanup(&store, &[format!("{prefix}*")]).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_liveness_expires_with_ttl() {
    let store = store().await;
    let service = format!("{}:svc", test_prefix());

    let mut tracker = LivenessTracker::new(
        store.clone(),
        service.as_str(),
        "c1",
        Duration::from_millis(50),
        Duration::from_millis(200),
    )
    .unwrap();
    tracker.run();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.is_alive(&service, "c1").await.unwrap());

    tracker.stop().await.unwrap();
    assert!(!store.is_alive(&service, "c1").await.unwrap());

    // A record that is never refreshed lapses by itself.
    store
        .touch_alive(&service, "c2", Duration::from_millis(100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!store.is_alive(&service, "c2").await.unwrap());

    cleanup(&store, &[format!("{service}*")]).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_coordinators_converge_on_disjoint_shares() {
    let store = store().await;
    let service = format!("{}:svc", test_prefix());
    store.register_service(&service, 5, &[]).await.unwrap();

    let ttl = Duration::from_secs(5);
    let coordinators: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|id| PartitionCoordinator::new(store.clone(), service.as_str(), id, ttl))
        .collect();
    for _ in 0..2 {
        for coordinator in &coordinators {
            coordinator.partitions_for().await.unwrap();
        }
    }

    let shares: Vec<BTreeSet<u32>> = coordinators.iter().map(|c| (*c.owned()).clone()).collect();
    assert_eq!(shares[0], BTreeSet::from([0, 3]));
    assert_eq!(shares[1], BTreeSet::from([1, 4]));
    assert_eq!(shares[2], BTreeSet::from([2]));

    cleanup(&store, &[format!("{service}*")]).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_consumer_processes_and_dead_letters() {
    let store = store().await;
    let prefix = test_prefix();
    let service = format!("{prefix}:svc");
    let ok_event = format!("{prefix}:ok");
    let bad_event = format!("{prefix}:bad");

    let processed = Arc::new(AtomicUsize::new(0));
    let emitter = Emitter::new();
    {
        let processed = processed.clone();
        emitter.receive(&ok_event, None, move |_| {
            processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    emitter.receive(&bad_event, None, |_| Err("rejected".into()));

    let config = BusConfig::new(service.as_str()).with_endpoint(get_redis_url());
    let consumer = Consumer::new(store.clone(), config, Arc::new(emitter)).unwrap();
    consumer.register().await.unwrap();

    let producer = Producer::new(store.clone(), "shop");
    producer.emit(&ok_event, json!(1), EmitOptions::new()).await.unwrap();
    producer.emit(&bad_event, json!(2), EmitOptions::new()).await.unwrap();

    assert_eq!(consumer.consume_once().await, 1);
    assert_eq!(consumer.consume_once().await, 1);
    assert_eq!(consumer.consume_once().await, 0);

    let queue = keys::partition_queue(&service, 0);
    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert_eq!(store.queue_len(&queue).await.unwrap(), 0);
    let dead = store
        .queue_items(&keys::dead_letter_queue(&queue))
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(Event::decode(&dead[0]).unwrap().name(), bad_event);

    cleanup(&store, &[format!("{prefix}*")]).await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_acknowledge_only_removes_the_processed_item() {
    let store = store().await;
    let queue = format!("{}:svc:0", test_prefix());
    let dead_letter_queue = keys::dead_letter_queue(&queue);
    store.push(&queue, b"first").await.unwrap();
    store.push(&queue, b"second").await.unwrap();
    store.push(&queue, b"third").await.unwrap();

    // Two overlapping owners acknowledge the same item.
    assert!(store.remove_if_oldest(&queue, b"first").await.unwrap());
    assert!(!store.remove_if_oldest(&queue, b"first").await.unwrap());
    assert_eq!(
        store.peek_oldest(&queue).await.unwrap().as_deref(),
        Some(&b"second"[..])
    );

    // And dead-letter the next one.
    assert!(store
        .dead_letter_if_oldest(&queue, &dead_letter_queue, b"second")
        .await
        .unwrap());
    assert!(!store
        .dead_letter_if_oldest(&queue, &dead_letter_queue, b"second")
        .await
        .unwrap());

    assert_eq!(
        store.queue_items(&queue).await.unwrap(),
        vec![b"third".to_vec()]
    );
    assert_eq!(
        store.queue_items(&dead_letter_queue).await.unwrap(),
        vec![b"second".to_vec()]
    );

    cleanup(&store, &[format!("{queue}*")]).await;
}
