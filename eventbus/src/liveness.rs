use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result, Store};

/// Keeps `<service>:<consumer>:alive` set while running.
///
/// The record is written with a TTL longer than the heartbeat interval, so a
/// consumer that stops beating (crash, partition, kill -9) is considered dead
/// once the TTL runs out. A failed beat is logged and retried on the next
/// tick.
pub struct LivenessTracker {
    store: Store,
    service: String,
    consumer_id: String,
    interval: Duration,
    ttl: Duration,
    cancel_token: CancellationToken,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl LivenessTracker {
    /// # Errors
    ///
    /// Returns [`Error::Config`] unless `ttl > interval > 0`.
    pub fn new(
        store: Store,
        service: impl Into<String>,
        consumer_id: impl Into<String>,
        interval: Duration,
        ttl: Duration,
    ) -> Result<Self> {
        if interval.is_zero() || ttl <= interval {
            return Err(Error::config(format!(
                "liveness ttl ({ttl:?}) must exceed a non-zero heartbeat interval ({interval:?})"
            )));
        }
        Ok(Self {
            store,
            service: service.into(),
            consumer_id: consumer_id.into(),
            interval,
            ttl,
            cancel_token: CancellationToken::new(),
            heartbeat_handle: None,
        })
    }

    /// Tie the heartbeat to a parent token: cancelling the parent stops beats.
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel_token = parent.child_token();
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the heartbeat task. The first beat is written immediately.
    /// Calling `run` on a running tracker does nothing.
    pub fn run(&mut self) {
        if self.heartbeat_handle.is_some() {
            return;
        }
        tracing::info!(
            service = %self.service,
            consumer_id = %self.consumer_id,
            interval_ms = self.interval.as_millis() as u64,
            ttl_ms = self.ttl.as_millis() as u64,
            "Starting heartbeat"
        );
        self.heartbeat_handle = Some(Self::spawn_heartbeat_task(
            self.store.clone(),
            self.service.clone(),
            self.consumer_id.clone(),
            self.interval,
            self.ttl,
            self.cancel_token.clone(),
        ));
    }

    fn spawn_heartbeat_task(
        store: Store,
        service: String,
        consumer_id: String,
        interval: Duration,
        ttl: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut heartbeat_interval = tokio::time::interval(interval);
            heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!(%consumer_id, "Heartbeat task shutting down");
                        break;
                    }

                    _ = heartbeat_interval.tick() => {
                        match store.touch_alive(&service, &consumer_id, ttl).await {
                            Ok(()) => {
                                if consecutive_failures > 0 {
                                    tracing::info!(
                                        %consumer_id,
                                        failures = consecutive_failures,
                                        "Heartbeat recovered"
                                    );
                                }
                                consecutive_failures = 0;
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                tracing::warn!(
                                    %consumer_id,
                                    failures = consecutive_failures,
                                    "Heartbeat failed: {}, retrying next tick",
                                    e
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    /// Stop beating and delete the liveness record.
    ///
    /// Once this returns no further heartbeat will be written, so peers see
    /// the consumer as dead on their next partition query.
    ///
    /// # Errors
    ///
    /// Returns an error if the liveness record could not be deleted; it will
    /// then expire on its own after the TTL.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel_token.cancel();

        let Some(handle) = self.heartbeat_handle.take() else {
            return Ok(());
        };
        if let Err(e) = handle.await {
            tracing::warn!(consumer_id = %self.consumer_id, "Heartbeat task ended abnormally: {}", e);
        }

        self.store
            .clear_alive(&self.service, &self.consumer_id)
            .await?;
        tracing::info!(
            service = %self.service,
            consumer_id = %self.consumer_id,
            "Heartbeat stopped, liveness cleared"
        );
        Ok(())
    }
}

impl Drop for LivenessTracker {
    fn drop(&mut self) {
        if self.heartbeat_handle.is_some() {
            self.cancel_token.cancel();
            tracing::debug!(
                consumer_id = %self.consumer_id,
                "LivenessTracker dropped while running (stop should be called explicitly)"
            );
        }
    }
}
