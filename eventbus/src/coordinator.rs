//! Partition ownership for a consumer group.
//!
//! Every consumer of a service periodically asks which partitions it should
//! drain. The answer comes from a read / plan / compare-and-swap cycle against
//! the store:
//!
//! 1. refresh the caller's liveness and read an [`OwnershipSnapshot`];
//! 2. deal partitions round-robin over the sorted alive consumer ids;
//! 3. claim the desired partitions whose recorded owner is free (absent,
//!    itself, or dead) and release the recorded ones it no longer wants;
//! 4. commit the change only if the ownership epoch did not move.
//!
//! A partition held by a live peer is never taken over directly; the peer
//! releases it on its own next call, so two live consumers never both own a
//! partition. Once every alive consumer has called twice the assignment is
//! complete and balanced, and further calls change nothing.

use arc_swap::ArcSwap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::store::{OwnershipChange, OwnershipSnapshot};
use crate::{Error, Result, Store};

/// Compare-and-swap attempts per call before giving up for this round.
pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Deal `[0, partition_count)` round-robin over the sorted consumer ids:
/// partition `p` goes to `consumers[p % n]`.
///
/// Returns one set per consumer, in sorted id order. Consumers beyond
/// `partition_count` receive empty sets.
pub fn assign<'a>(
    consumers: &'a BTreeSet<String>,
    partition_count: u32,
) -> Vec<(&'a str, BTreeSet<u32>)> {
    let mut shares: Vec<(&str, BTreeSet<u32>)> = consumers
        .iter()
        .map(|id| (id.as_str(), BTreeSet::new()))
        .collect();
    if shares.is_empty() {
        return shares;
    }
    let n = shares.len();
    for partition in 0..partition_count {
        shares[partition as usize % n].1.insert(partition);
    }
    shares
}

/// Compute the ownership write for `consumer_id` from `snapshot`, and the
/// partitions it owns once that write is applied.
pub fn plan(snapshot: &OwnershipSnapshot, consumer_id: &str) -> (OwnershipChange, BTreeSet<u32>) {
    let mut alive = snapshot.alive.clone();
    alive.insert(consumer_id.to_string());

    let desired = assign(&alive, snapshot.partition_count)
        .into_iter()
        .find(|(id, _)| *id == consumer_id)
        .map(|(_, share)| share)
        .unwrap_or_default();

    let mut change = OwnershipChange {
        expected_epoch: snapshot.epoch,
        consumer_id: consumer_id.to_string(),
        ..Default::default()
    };
    let mut owned = BTreeSet::new();

    for &partition in &desired {
        match snapshot.owners.get(&partition) {
            Some(owner) if owner == consumer_id => {
                owned.insert(partition);
            }
            Some(owner) if alive.contains(owner) => {
                // Held by a live peer; it lets go on its own next call.
            }
            _ => {
                change.grants.push(partition);
                owned.insert(partition);
            }
        }
    }

    change.releases = snapshot
        .owners
        .iter()
        .filter(|(partition, owner)| *owner == consumer_id && !desired.contains(*partition))
        .map(|(partition, _)| *partition)
        .collect();

    change.dead = snapshot
        .dead
        .iter()
        .filter(|id| *id != consumer_id)
        .cloned()
        .collect();

    (change, owned)
}

/// Answers "which partitions of `service` do I drain" for one consumer.
pub struct PartitionCoordinator {
    store: Store,
    service: String,
    consumer_id: String,
    liveness_ttl: Duration,
    owned: ArcSwap<BTreeSet<u32>>,
}

impl PartitionCoordinator {
    pub fn new(
        store: Store,
        service: impl Into<String>,
        consumer_id: impl Into<String>,
        liveness_ttl: Duration,
    ) -> Self {
        Self {
            store,
            service: service.into(),
            consumer_id: consumer_id.into(),
            liveness_ttl,
            owned: ArcSwap::from_pointee(BTreeSet::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Partitions returned by the last successful call to
    /// [`partitions_for`](Self::partitions_for).
    pub fn owned(&self) -> Arc<BTreeSet<u32>> {
        self.owned.load_full()
    }

    /// Recompute and persist the assignment, returning the caller's share.
    ///
    /// # Errors
    ///
    /// Store errors are returned as-is. [`Error::Conflict`] means every
    /// compare-and-swap attempt lost to a concurrent writer; callers treat
    /// both as "no partitions this round" and try again later.
    pub async fn partitions_for(&self) -> Result<BTreeSet<u32>> {
        self.store
            .touch_alive(&self.service, &self.consumer_id, self.liveness_ttl)
            .await?;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let snapshot = self.store.ownership_snapshot(&self.service).await?;
            let (change, owned) = plan(&snapshot, &self.consumer_id);

            if change.is_empty() {
                self.record(owned.clone());
                return Ok(owned);
            }

            if self.store.commit_ownership(&self.service, &change).await? {
                if !change.dead.is_empty() {
                    tracing::info!(
                        service = %self.service,
                        consumer_id = %self.consumer_id,
                        dead = ?change.dead,
                        "Pruned dead consumers"
                    );
                }
                self.record(owned.clone());
                return Ok(owned);
            }

            tracing::debug!(
                service = %self.service,
                consumer_id = %self.consumer_id,
                attempt,
                epoch = snapshot.epoch,
                "Ownership changed concurrently, re-reading"
            );
        }

        Err(Error::Conflict(format!(
            "ownership of {} kept changing over {} attempts",
            self.service, MAX_COMMIT_ATTEMPTS
        )))
    }

    fn record(&self, owned: BTreeSet<u32>) {
        let previous = self.owned.load();
        if **previous != owned {
            tracing::debug!(
                service = %self.service,
                consumer_id = %self.consumer_id,
                partitions = ?owned,
                "Partition assignment changed"
            );
            self.owned.store(Arc::new(owned));
        }
    }
}
