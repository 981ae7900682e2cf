use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{OwnershipChange, OwnershipSnapshot};
use crate::{keys, router, Error, Result};

/// In-process store with the Redis key layout.
///
/// Every operation runs under one lock, so the scripted operations are atomic
/// the same way they are on Redis. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    injected_failures: u32,
}

impl MemoryState {
    fn check_failure(&mut self) -> Result<()> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(Error::connection("injected store failure"));
        }
        Ok(())
    }

    fn get(&mut self, key: &str) -> Option<&str> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key).map(|(value, _)| value.as_str())
    }

    fn set(&mut self, key: String, value: String, ttl: Option<Duration>) {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.strings.insert(key, (value, deadline));
    }

    fn list(&mut self, key: &str) -> &mut VecDeque<Vec<u8>> {
        self.lists.entry(key.to_string()).or_default()
    }

    fn pop_if_oldest(&mut self, queue: &str, raw: &[u8]) -> Option<Vec<u8>> {
        let list = self.lists.get_mut(queue)?;
        if list.back().map(Vec::as_slice) == Some(raw) {
            list.pop_back()
        } else {
            None
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a transient connection
    /// error, to exercise retry and fail-soft paths.
    pub async fn inject_failures(&self, count: u32) {
        self.state.lock().await.injected_failures = count;
    }

    pub async fn register_service(
        &self,
        service: &str,
        partition_count: u32,
        event_names: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        state.set(
            keys::partition_count(service),
            partition_count.to_string(),
            None,
        );
        for name in event_names {
            state
                .sets
                .entry(keys::subscribers(name))
                .or_default()
                .insert(service.to_string());
        }
        Ok(())
    }

    pub async fn partition_count(&self, service: &str) -> Result<Option<u32>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state
            .get(&keys::partition_count(service))
            .and_then(|raw| raw.parse().ok()))
    }

    pub async fn subscribers(&self, event_name: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state
            .sets
            .get(&keys::subscribers(event_name))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn append_event(&self, event_name: &str, key_hash: u32, raw: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        let services: Vec<String> = state
            .sets
            .get(&keys::subscribers(event_name))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let counts: Vec<u32> = services
            .iter()
            .map(|service| {
                state
                    .get(&keys::partition_count(service))
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(1)
            })
            .collect();
        let subscribers = services.iter().map(String::as_str).zip(counts);
        for (service, partition) in router::route(key_hash, subscribers) {
            let queue = keys::partition_queue(service, partition);
            state.list(&queue).push_front(raw.to_vec());
        }
        Ok(services.len())
    }

    pub async fn peek_oldest(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state.lists.get(queue).and_then(|list| list.back().cloned()))
    }

    pub async fn remove_if_oldest(&self, queue: &str, raw: &[u8]) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state.pop_if_oldest(queue, raw).is_some())
    }

    pub async fn dead_letter_if_oldest(
        &self,
        queue: &str,
        dead_letter_queue: &str,
        raw: &[u8],
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        match state.pop_if_oldest(queue, raw) {
            Some(item) => {
                state.list(dead_letter_queue).push_front(item);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn push(&self, queue: &str, raw: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        state.list(queue).push_front(raw.to_vec());
        Ok(())
    }

    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state.lists.get(queue).map_or(0, VecDeque::len))
    }

    pub async fn queue_items(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state
            .lists
            .get(queue)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn touch_alive(&self, service: &str, consumer_id: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        state.set(keys::alive(service, consumer_id), "1".to_string(), Some(ttl));
        state
            .sets
            .entry(keys::consumers(service))
            .or_default()
            .insert(consumer_id.to_string());
        Ok(())
    }

    pub async fn clear_alive(&self, service: &str, consumer_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        state.strings.remove(&keys::alive(service, consumer_id));
        if let Some(consumers) = state.sets.get_mut(&keys::consumers(service)) {
            consumers.remove(consumer_id);
        }
        Ok(())
    }

    pub async fn is_alive(&self, service: &str, consumer_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state.get(&keys::alive(service, consumer_id)).is_some())
    }

    pub async fn ownership_snapshot(&self, service: &str) -> Result<OwnershipSnapshot> {
        let mut state = self.state.lock().await;
        state.check_failure()?;

        let partition_count = state
            .get(&keys::partition_count(service))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1u32)
            .max(1);
        let epoch = state
            .get(&keys::owners_epoch(service))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let owners = state
            .hashes
            .get(&keys::owners(service))
            .map(|hash| {
                hash.iter()
                    .filter_map(|(p, owner)| p.parse().ok().map(|p| (p, owner.clone())))
                    .collect()
            })
            .unwrap_or_default();

        let members: Vec<String> = state
            .sets
            .get(&keys::consumers(service))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut snapshot = OwnershipSnapshot {
            epoch,
            partition_count,
            owners,
            ..Default::default()
        };
        for member in members {
            if state.get(&keys::alive(service, &member)).is_some() {
                snapshot.alive.insert(member);
            } else {
                snapshot.dead.insert(member);
            }
        }
        Ok(snapshot)
    }

    pub async fn commit_ownership(&self, service: &str, change: &OwnershipChange) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_failure()?;

        let epoch_key = keys::owners_epoch(service);
        let epoch: u64 = state
            .get(&epoch_key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        if epoch != change.expected_epoch {
            return Ok(false);
        }

        let owners = state.hashes.entry(keys::owners(service)).or_default();
        for partition in &change.grants {
            owners.insert(partition.to_string(), change.consumer_id.clone());
        }
        for partition in &change.releases {
            let field = partition.to_string();
            if owners.get(&field) == Some(&change.consumer_id) {
                owners.remove(&field);
            }
        }
        if let Some(consumers) = state.sets.get_mut(&keys::consumers(service)) {
            for dead in &change.dead {
                consumers.remove(dead);
            }
        }
        state.set(epoch_key, (epoch + 1).to_string(), None);
        Ok(true)
    }
}
