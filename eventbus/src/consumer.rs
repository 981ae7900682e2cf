use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lifecycle::{LifeCycleEventHandler, NoopLifeCycle};
use crate::{
    keys, BusConfig, Emitter, Error, Event, LivenessTracker, PartitionCoordinator, Result,
    RetryPolicy, Store,
};

/// Where a consumer loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    Dispatching,
    Sleeping,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Dispatching => "dispatching",
            Self::Sleeping => "sleeping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Stops a running [`Consumer`] from another task.
#[derive(Clone)]
pub struct ConsumerHandle {
    cancel_token: CancellationToken,
    state: watch::Receiver<ConsumerState>,
}

impl ConsumerHandle {
    /// Ask the loop to stop. Returns immediately; the loop finishes the item
    /// it is processing, clears its liveness record and then reports
    /// [`ConsumerState::Stopped`].
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Wait until the loop has fully stopped.
    pub async fn stopped(&mut self) {
        // Err only if the consumer was dropped, which also means it stopped.
        let _ = self
            .state
            .wait_for(|state| *state == ConsumerState::Stopped)
            .await;
    }
}

/// Drains the partitions of one service assigned to this process and
/// dispatches their events to local handlers.
///
/// Processing is at-least-once: an item is removed from its queue only after
/// its handlers ran (or it was dead-lettered), so a crash in between replays
/// it to whichever consumer owns the partition next.
pub struct Consumer {
    store: Store,
    config: BusConfig,
    consumer_id: String,
    emitter: Arc<Emitter>,
    life_cycle: Arc<dyn LifeCycleEventHandler>,
    coordinator: PartitionCoordinator,
    retry: RetryPolicy,
    cancel_token: CancellationToken,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn new(store: Store, config: BusConfig, emitter: Arc<Emitter>) -> Result<Self> {
        config.validate()?;
        let consumer_id = Uuid::new_v4().to_string();
        let coordinator = PartitionCoordinator::new(
            store.clone(),
            config.client_id.clone(),
            consumer_id.clone(),
            config.liveness_ttl,
        );
        let (state, _) = watch::channel(ConsumerState::Idle);
        Ok(Self {
            store,
            config,
            consumer_id,
            emitter,
            life_cycle: Arc::new(NoopLifeCycle),
            coordinator,
            retry: RetryPolicy::default(),
            cancel_token: CancellationToken::new(),
            state,
        })
    }

    /// Replace the generated consumer id, e.g. with a stable host name.
    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self.coordinator = PartitionCoordinator::new(
            self.store.clone(),
            self.config.client_id.clone(),
            self.consumer_id.clone(),
            self.config.liveness_ttl,
        );
        self
    }

    pub fn with_life_cycle(mut self, life_cycle: Arc<dyn LifeCycleEventHandler>) -> Self {
        self.life_cycle = life_cycle;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn service(&self) -> &str {
        &self.config.client_id
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn coordinator(&self) -> &PartitionCoordinator {
        &self.coordinator
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            cancel_token: self.cancel_token.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Record this service's partition count and subscribe it to every event
    /// name a local handler listens for.
    ///
    /// Events emitted before registration are not delivered to the service.
    pub async fn register(&self) -> Result<()> {
        let event_names = self.emitter.event_names();
        let service = self.service();
        let partition_count = self.config.partition_count;
        let store = &self.store;
        let names = event_names.as_slice();
        self.retry
            .run("register", move || {
                store.register_service(service, partition_count, names)
            })
            .await?;

        tracing::info!(
            service,
            partition_count,
            events = ?event_names,
            "Registered service"
        );
        self.life_cycle
            .on_registered(service, &self.emitter.subscriptions(), partition_count)
            .await;
        Ok(())
    }

    /// Register, then consume until [`stop`](Self::stop) is called.
    ///
    /// The heartbeat runs alongside the loop and is torn down, and the
    /// liveness record cleared, before the state turns
    /// [`ConsumerState::Stopped`].
    ///
    /// # Errors
    ///
    /// Returns an error only if registration or heartbeat setup fails.
    pub async fn run(&self) -> Result<()> {
        let result = self.run_inner().await;
        self.set_state(ConsumerState::Stopped);
        result
    }

    async fn run_inner(&self) -> Result<()> {
        self.register().await?;

        let mut tracker = LivenessTracker::new(
            self.store.clone(),
            self.service(),
            self.consumer_id.as_str(),
            self.config.heartbeat_interval,
            self.config.liveness_ttl,
        )?
        .with_parent(&self.cancel_token);
        tracker.run();

        tracing::info!(
            service = %self.service(),
            consumer_id = %self.consumer_id,
            "Consumer started"
        );

        while !self.cancel_token.is_cancelled() {
            let processed = self.consume_once().await;
            if processed > 0 || self.cancel_token.is_cancelled() {
                continue;
            }

            self.set_state(ConsumerState::Sleeping);
            tracing::trace!(consumer_id = %self.consumer_id, "Nothing to consume, sleeping");
            tokio::select! {
                _ = self.cancel_token.cancelled() => {}
                _ = tokio::time::sleep(self.config.idle_sleep) => {}
            }
        }

        if let Err(e) = tracker.stop().await {
            tracing::warn!(
                consumer_id = %self.consumer_id,
                "Failed to clear liveness record: {}",
                e
            );
        }
        tracing::info!(
            service = %self.service(),
            consumer_id = %self.consumer_id,
            "Consumer stopped"
        );
        Ok(())
    }

    /// One pass over the owned partitions, processing at most the oldest item
    /// of each. Returns the number of items processed.
    ///
    /// Store failures are logged and skipped; the next pass retries.
    pub async fn consume_once(&self) -> usize {
        self.set_state(ConsumerState::Polling);

        let partitions = match self.coordinator.partitions_for().await {
            Ok(partitions) => partitions,
            Err(e) => {
                tracing::warn!(
                    service = %self.service(),
                    consumer_id = %self.consumer_id,
                    "Partition query failed: {}",
                    e
                );
                return 0;
            }
        };

        let mut processed = 0;
        for partition in partitions {
            if self.cancel_token.is_cancelled() {
                break;
            }

            let queue = keys::partition_queue(self.service(), partition);
            let store = &self.store;
            let queue_name = queue.as_str();
            let item = match self
                .retry
                .run("peek", move || store.peek_oldest(queue_name))
                .await
            {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(%queue, "Failed to read queue: {}", e);
                    continue;
                }
            };

            self.set_state(ConsumerState::Dispatching);
            self.process(&queue, &item).await;
            processed += 1;
            self.set_state(ConsumerState::Polling);
        }
        processed
    }

    async fn process(&self, queue: &str, raw: &[u8]) {
        let (decoded, outcome) = match serde_json::from_slice::<Value>(raw) {
            Ok(value) => {
                let outcome = self.dispatch(&value);
                (Some(value), outcome)
            }
            Err(e) => (None, Err(Error::from(e))),
        };

        match outcome {
            Ok(event) => {
                self.life_cycle
                    .on_success(event.name(), event.version(), &event)
                    .await;
                self.remove(queue, raw).await;
            }
            Err(error) => {
                let dead_letter_queue = keys::dead_letter_queue(queue);
                let store = &self.store;
                let dlq = dead_letter_queue.as_str();
                let moved = self
                    .retry
                    .run("dead_letter", move || {
                        store.dead_letter_if_oldest(queue, dlq, raw)
                    })
                    .await;

                self.life_cycle
                    .on_failure(&error, decoded.as_ref(), raw, &dead_letter_queue)
                    .await;

                match moved {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(%queue, "Item already handled by another consumer");
                    }
                    Err(e) => {
                        // Left in place; it is retried on a later pass.
                        tracing::error!(
                            %queue,
                            %dead_letter_queue,
                            "Failed to dead-letter item, keeping it queued: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    fn dispatch(&self, value: &Value) -> Result<Event> {
        let event = Event::deserialize(value)?;
        self.emitter.broadcast(&event)?;
        Ok(event)
    }

    async fn remove(&self, queue: &str, raw: &[u8]) {
        let store = &self.store;
        match self
            .retry
            .run("remove", move || store.remove_if_oldest(queue, raw))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // A previous owner overlapping this pass acknowledged it first.
                tracing::debug!(%queue, "Item already acknowledged by another consumer");
            }
            Err(e) => {
                tracing::error!(%queue, "Failed to remove processed item: {}", e);
            }
        }
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("service", &self.config.client_id)
            .field("consumer_id", &self.consumer_id)
            .field("state", &self.state())
            .finish()
    }
}
