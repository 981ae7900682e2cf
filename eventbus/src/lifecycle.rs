use async_trait::async_trait;
use serde_json::Value;

use crate::{Error, Event, Subscription};

/// Hooks invoked by a consumer as it registers and processes events.
///
/// Every method defaults to doing nothing, so implementors only override the
/// callbacks they care about (metrics, alerting, audit logs).
#[async_trait]
pub trait LifeCycleEventHandler: Send + Sync {
    /// The consumer registered `service_id` for `events` with `partition_count`
    /// partitions.
    async fn on_registered(
        &self,
        _service_id: &str,
        _events: &[Subscription],
        _partition_count: u32,
    ) {
    }

    /// Every local handler accepted the event.
    async fn on_success(&self, _event_name: &str, _version: Option<u32>, _event: &Event) {}

    /// Decoding or a handler failed. `dead_letter_queue` is where the raw item
    /// is moved; `decoded` is the parsed JSON when the item was at least valid
    /// JSON.
    ///
    /// The move may still fail after retries. The item then stays in its
    /// partition queue, is redelivered on a later pass, and this callback
    /// fires again for it. Count entries in `dead_letter_queue` rather than
    /// calls to this method when an exact tally is needed.
    async fn on_failure(
        &self,
        _error: &Error,
        _decoded: Option<&Value>,
        _raw: &[u8],
        _dead_letter_queue: &str,
    ) {
    }
}

pub struct NoopLifeCycle;

impl LifeCycleEventHandler for NoopLifeCycle {}

/// Logs every callback through `tracing`.
pub struct TracingLifeCycle;

#[async_trait]
impl LifeCycleEventHandler for TracingLifeCycle {
    async fn on_registered(&self, service_id: &str, events: &[Subscription], partition_count: u32) {
        let names: Vec<String> = events
            .iter()
            .map(|s| match s.version {
                Some(v) => format!("{}:{}", s.name, v),
                None => s.name.clone(),
            })
            .collect();
        tracing::info!(
            service_id,
            partition_count,
            events = ?names,
            "Service registered"
        );
    }

    async fn on_success(&self, event_name: &str, version: Option<u32>, event: &Event) {
        tracing::debug!(
            event_name,
            ?version,
            event_id = %event.meta.event_id,
            "Event processed"
        );
    }

    async fn on_failure(
        &self,
        error: &Error,
        decoded: Option<&Value>,
        raw: &[u8],
        dead_letter_queue: &str,
    ) {
        tracing::error!(
            dead_letter_queue,
            decoded = decoded.is_some(),
            raw_len = raw.len(),
            "Event processing failed: {}",
            error
        );
    }
}
