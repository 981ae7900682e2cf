use serde_json::Value;

use crate::{router, Event, Result, RetryPolicy, Store};

/// Optional parts of an emitted event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitOptions {
    pub version: Option<u32>,
    /// Generated when absent.
    pub correlation_id: Option<String>,
    /// Partition key; the serialized payload is hashed when absent.
    pub key: Option<String>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Writes events into the partition queues of every subscribing service.
#[derive(Debug, Clone)]
pub struct Producer {
    store: Store,
    producer_id: String,
    retry: RetryPolicy,
}

impl Producer {
    pub fn new(store: Store, producer_id: impl Into<String>) -> Self {
        Self {
            store,
            producer_id: producer_id.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Build and deliver one event.
    ///
    /// Every subscribing service receives the event in exactly one of its
    /// partitions, all in a single atomic store call. An event nobody
    /// subscribes to is dropped, and still returned.
    ///
    /// # Errors
    ///
    /// [`Error::RetryExhausted`](crate::Error::RetryExhausted) when the store
    /// kept failing transiently; other store errors as returned.
    pub async fn emit(&self, name: &str, payload: Value, options: EmitOptions) -> Result<Event> {
        let key_hash = router::partition_key(options.key.as_deref(), &payload);
        let event = Event::new(
            name,
            payload,
            options.version,
            options.correlation_id,
            self.producer_id.as_str(),
        );
        let raw = event.encode()?;

        let store = &self.store;
        let raw = raw.as_slice();
        let written = self
            .retry
            .run("emit", move || store.append_event(name, key_hash, raw))
            .await?;

        if written == 0 {
            tracing::debug!(event_name = name, event_id = %event.meta.event_id, "No subscribers, event dropped");
        } else {
            tracing::debug!(
                event_name = name,
                event_id = %event.meta.event_id,
                services = written,
                key_hash,
                "Event emitted"
            );
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys, Error};
    use serde_json::json;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_micros(1),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_returns_event() {
        let producer = Producer::new(Store::memory(), "shop");
        let event = producer
            .emit("orders:created", json!({"id": 1}), EmitOptions::new().version(2))
            .await
            .unwrap();
        assert_eq!(event.name(), "orders:created");
        assert_eq!(event.version(), Some(2));
        assert_eq!(event.meta.producer_id, "shop");
    }

    #[tokio::test]
    async fn test_emit_keeps_supplied_correlation_id() {
        let store = Store::memory();
        store
            .register_service("billing", 1, &["orders:created".to_string()])
            .await
            .unwrap();
        let producer = Producer::new(store.clone(), "shop");

        let event = producer
            .emit(
                "orders:created",
                json!({}),
                EmitOptions::new().correlation_id("req-42"),
            )
            .await
            .unwrap();

        let stored = store
            .peek_oldest(&keys::partition_queue("billing", 0))
            .await
            .unwrap()
            .unwrap();
        let decoded = Event::decode(&stored).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.meta.correlation_id, "req-42");
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let store = Store::memory();
        store
            .register_service("billing", 8, &["orders:created".to_string()])
            .await
            .unwrap();
        let producer = Producer::new(store.clone(), "shop");

        for i in 0..5 {
            producer
                .emit("orders:created", json!({ "i": i }), EmitOptions::new().key("customer-7"))
                .await
                .unwrap();
        }

        let partition = router::partition_index(router::crc32(b"customer-7"), 8);
        let queue = keys::partition_queue("billing", partition);
        assert_eq!(store.queue_len(&queue).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_emit_survives_transient_failures() {
        let store = Store::memory();
        store
            .register_service("billing", 1, &["a".to_string()])
            .await
            .unwrap();
        let Store::Memory(memory) = &store else {
            unreachable!()
        };
        memory.inject_failures(3).await;

        let producer = Producer::new(store.clone(), "shop").with_retry(fast_retry());
        producer.emit("a", json!(1), EmitOptions::new()).await.unwrap();
        assert_eq!(store.queue_len("billing:0").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_emit_surfaces_retry_exhaustion() {
        let store = Store::memory();
        let Store::Memory(memory) = &store else {
            unreachable!()
        };
        memory.inject_failures(4).await;

        let producer = Producer::new(store, "shop").with_retry(fast_retry());
        let err = producer.emit("a", json!(1), EmitOptions::new()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RetryExhausted { operation: "emit", attempts: 4, .. }
        ));
    }
}
