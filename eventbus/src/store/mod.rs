//! Store adapter.
//!
//! [`Store`] is a closed set of backends chosen at construction time by
//! [`Store::connect`]. Each backend exposes the same primitives (queue
//! push/peek/pop, set membership, presence keys with expiry) plus two
//! operations that must be atomic: fanning an event out to every subscriber's
//! partition queue, and the compare-and-swap write of partition ownership.

mod memory;
mod redis_backend;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub use self::memory::MemoryStore;
pub use self::redis_backend::RedisStore;
use crate::config::{Backend, BusConfig};
use crate::Result;

/// Consistent read of a service's consumer group, taken before computing a
/// new assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipSnapshot {
    /// Compare-and-swap token; the ownership write only applies if unchanged.
    pub epoch: u64,
    pub partition_count: u32,
    /// Known consumers whose liveness record still exists.
    pub alive: BTreeSet<String>,
    /// Known consumers whose liveness record has expired.
    pub dead: BTreeSet<String>,
    /// Recorded owner per partition index.
    pub owners: BTreeMap<u32, String>,
}

/// Ownership write for one consumer, applied only if `expected_epoch` still
/// matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipChange {
    pub expected_epoch: u64,
    pub consumer_id: String,
    /// Partitions to record as owned by `consumer_id`.
    pub grants: Vec<u32>,
    /// Partitions `consumer_id` gives up. Ignored for partitions it no longer owns.
    pub releases: Vec<u32>,
    /// Consumers to forget.
    pub dead: Vec<String>,
}

impl OwnershipChange {
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.releases.is_empty() && self.dead.is_empty()
    }
}

#[derive(Clone)]
pub enum Store {
    Redis(RedisStore),
    Memory(MemoryStore),
}

impl Store {
    /// Build the backend named by `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis endpoint is invalid or unreachable.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        match config.backend {
            Backend::Redis => Ok(Self::Redis(RedisStore::connect(&config.endpoint).await?)),
            Backend::Memory => Ok(Self::memory()),
        }
    }

    /// Fresh, empty in-process store.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Redis(_) => Backend::Redis,
            Self::Memory(_) => Backend::Memory,
        }
    }

    /// Record `service`'s partition count and subscribe it to `event_names`.
    pub async fn register_service(
        &self,
        service: &str,
        partition_count: u32,
        event_names: &[String],
    ) -> Result<()> {
        match self {
            Self::Redis(s) => s.register_service(service, partition_count, event_names).await,
            Self::Memory(s) => s.register_service(service, partition_count, event_names).await,
        }
    }

    pub async fn partition_count(&self, service: &str) -> Result<Option<u32>> {
        match self {
            Self::Redis(s) => s.partition_count(service).await,
            Self::Memory(s) => s.partition_count(service).await,
        }
    }

    pub async fn subscribers(&self, event_name: &str) -> Result<Vec<String>> {
        match self {
            Self::Redis(s) => s.subscribers(event_name).await,
            Self::Memory(s) => s.subscribers(event_name).await,
        }
    }

    /// Push `raw` onto partition `key_hash mod partition_count` of every
    /// service subscribed to `event_name`, atomically. Returns the number of
    /// services written to.
    pub async fn append_event(&self, event_name: &str, key_hash: u32, raw: &[u8]) -> Result<usize> {
        match self {
            Self::Redis(s) => s.append_event(event_name, key_hash, raw).await,
            Self::Memory(s) => s.append_event(event_name, key_hash, raw).await,
        }
    }

    /// Oldest item of a queue, left in place.
    pub async fn peek_oldest(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Redis(s) => s.peek_oldest(queue).await,
            Self::Memory(s) => s.peek_oldest(queue).await,
        }
    }

    /// Acknowledge `raw`: pop the oldest item of `queue` only if it is still
    /// `raw`. Returns `false` when it was already acknowledged.
    pub async fn remove_if_oldest(&self, queue: &str, raw: &[u8]) -> Result<bool> {
        match self {
            Self::Redis(s) => s.remove_if_oldest(queue, raw).await,
            Self::Memory(s) => s.remove_if_oldest(queue, raw).await,
        }
    }

    /// Atomically move `raw` from the tail of `queue` to `dead_letter_queue`,
    /// only if it is still the oldest item. Returns `false` when it was
    /// already acknowledged or dead-lettered.
    pub async fn dead_letter_if_oldest(
        &self,
        queue: &str,
        dead_letter_queue: &str,
        raw: &[u8],
    ) -> Result<bool> {
        match self {
            Self::Redis(s) => s.dead_letter_if_oldest(queue, dead_letter_queue, raw).await,
            Self::Memory(s) => s.dead_letter_if_oldest(queue, dead_letter_queue, raw).await,
        }
    }

    /// Push `raw` at the head of `queue`.
    pub async fn push(&self, queue: &str, raw: &[u8]) -> Result<()> {
        match self {
            Self::Redis(s) => s.push(queue, raw).await,
            Self::Memory(s) => s.push(queue, raw).await,
        }
    }

    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        match self {
            Self::Redis(s) => s.queue_len(queue).await,
            Self::Memory(s) => s.queue_len(queue).await,
        }
    }

    /// All items of a queue, newest first.
    pub async fn queue_items(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        match self {
            Self::Redis(s) => s.queue_items(queue).await,
            Self::Memory(s) => s.queue_items(queue).await,
        }
    }

    /// Set (or refresh) the liveness record of a consumer.
    pub async fn touch_alive(&self, service: &str, consumer_id: &str, ttl: Duration) -> Result<()> {
        match self {
            Self::Redis(s) => s.touch_alive(service, consumer_id, ttl).await,
            Self::Memory(s) => s.touch_alive(service, consumer_id, ttl).await,
        }
    }

    pub async fn clear_alive(&self, service: &str, consumer_id: &str) -> Result<()> {
        match self {
            Self::Redis(s) => s.clear_alive(service, consumer_id).await,
            Self::Memory(s) => s.clear_alive(service, consumer_id).await,
        }
    }

    pub async fn is_alive(&self, service: &str, consumer_id: &str) -> Result<bool> {
        match self {
            Self::Redis(s) => s.is_alive(service, consumer_id).await,
            Self::Memory(s) => s.is_alive(service, consumer_id).await,
        }
    }

    pub async fn ownership_snapshot(&self, service: &str) -> Result<OwnershipSnapshot> {
        match self {
            Self::Redis(s) => s.ownership_snapshot(service).await,
            Self::Memory(s) => s.ownership_snapshot(service).await,
        }
    }

    /// Apply `change` if the ownership epoch is still `change.expected_epoch`.
    /// Returns `false` when another consumer wrote first.
    pub async fn commit_ownership(&self, service: &str, change: &OwnershipChange) -> Result<bool> {
        match self {
            Self::Redis(s) => s.commit_ownership(service, change).await,
            Self::Memory(s) => s.commit_ownership(service, change).await,
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Store").field(&self.backend()).finish()
    }
}
