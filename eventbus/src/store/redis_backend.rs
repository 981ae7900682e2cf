use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{OwnershipChange, OwnershipSnapshot};
use crate::{keys, Result};

/// Fan an event out to every subscribing service.
///
/// KEYS[1]: subscriber set of the event name.
/// ARGV[1]: serialized event, ARGV[2]: partition key hash.
static APPEND_EVENT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local services = redis.call('SMEMBERS', KEYS[1])
local hash = tonumber(ARGV[2])
for _, service in ipairs(services) do
  local count = tonumber(redis.call('GET', service .. ':partition_count') or '1') or 1
  if count < 1 then count = 1 end
  redis.call('LPUSH', service .. ':' .. string.format('%d', hash % count), ARGV[1])
end
return #services
"#,
    )
});

/// Compare-and-swap write of partition ownership.
///
/// KEYS: epoch, owners hash, consumers set.
/// ARGV: expected epoch, consumer id, grant count, release count, then the
/// granted partitions, the released partitions and the dead consumer ids.
static COMMIT_OWNERSHIP: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local epoch = tonumber(redis.call('GET', KEYS[1]) or '0')
if epoch ~= tonumber(ARGV[1]) then
  return 0
end
local consumer = ARGV[2]
local grants = tonumber(ARGV[3])
local releases = tonumber(ARGV[4])
local i = 5
for _ = 1, grants do
  redis.call('HSET', KEYS[2], ARGV[i], consumer)
  i = i + 1
end
for _ = 1, releases do
  if redis.call('HGET', KEYS[2], ARGV[i]) == consumer then
    redis.call('HDEL', KEYS[2], ARGV[i])
  end
  i = i + 1
end
while i <= #ARGV do
  redis.call('SREM', KEYS[3], ARGV[i])
  i = i + 1
end
redis.call('INCR', KEYS[1])
return 1
"#,
    )
});

/// Pop the oldest item of KEYS[1] only if it is still ARGV[1].
static ACK_OLDEST: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('LINDEX', KEYS[1], -1) == ARGV[1] then
  redis.call('RPOP', KEYS[1])
  return 1
end
return 0
"#,
    )
});

/// Move the oldest item of KEYS[1] to the head of KEYS[2] only if it is
/// still ARGV[1].
static DEAD_LETTER_OLDEST: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('LINDEX', KEYS[1], -1) == ARGV[1] then
  redis.call('RPOP', KEYS[1])
  redis.call('LPUSH', KEYS[2], ARGV[1])
  return 1
end
return 0
"#,
    )
});

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(redis_url, "Connected to Redis");
        Ok(Self { conn })
    }

    /// Wrap an already established connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub async fn register_service(
        &self,
        service: &str,
        partition_count: u32,
        event_names: &[String],
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(keys::partition_count(service), partition_count)
            .ignore();
        for name in event_names {
            pipe.sadd(keys::subscribers(name), service).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn partition_count(&self, service: &str) -> Result<Option<u32>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(keys::partition_count(service)).await?)
    }

    pub async fn subscribers(&self, event_name: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(keys::subscribers(event_name)).await?)
    }

    pub async fn append_event(&self, event_name: &str, key_hash: u32, raw: &[u8]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let written: usize = APPEND_EVENT
            .key(keys::subscribers(event_name))
            .arg(raw)
            .arg(key_hash)
            .invoke_async(&mut conn)
            .await?;
        Ok(written)
    }

    pub async fn peek_oldest(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.lindex(queue, -1).await?)
    }

    pub async fn remove_if_oldest(&self, queue: &str, raw: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = ACK_OLDEST
            .key(queue)
            .arg(raw)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    pub async fn dead_letter_if_oldest(
        &self,
        queue: &str,
        dead_letter_queue: &str,
        raw: &[u8],
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = DEAD_LETTER_OLDEST
            .key(queue)
            .key(dead_letter_queue)
            .arg(raw)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    pub async fn push(&self, queue: &str, raw: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue, raw).await?;
        Ok(())
    }

    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(queue).await?)
    }

    pub async fn queue_items(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(queue, 0, -1).await?)
    }

    pub async fn touch_alive(&self, service: &str, consumer_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let _: () = redis::pipe()
            .atomic()
            .pset_ex(keys::alive(service, consumer_id), 1, ttl_ms)
            .ignore()
            .sadd(keys::consumers(service), consumer_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn clear_alive(&self, service: &str, consumer_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(keys::alive(service, consumer_id))
            .ignore()
            .srem(keys::consumers(service), consumer_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn is_alive(&self, service: &str, consumer_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(keys::alive(service, consumer_id)).await?)
    }

    pub async fn ownership_snapshot(&self, service: &str) -> Result<OwnershipSnapshot> {
        let mut conn = self.conn.clone();

        let (partition_count, members, owners, epoch): (
            Option<u32>,
            Vec<String>,
            HashMap<String, String>,
            Option<u64>,
        ) = redis::pipe()
            .atomic()
            .get(keys::partition_count(service))
            .smembers(keys::consumers(service))
            .hgetall(keys::owners(service))
            .get(keys::owners_epoch(service))
            .query_async(&mut conn)
            .await?;

        let flags: Vec<bool> = if members.is_empty() {
            Vec::new()
        } else {
            let mut pipe = redis::pipe();
            for member in &members {
                pipe.exists(keys::alive(service, member));
            }
            pipe.query_async(&mut conn).await?
        };

        let mut snapshot = OwnershipSnapshot {
            epoch: epoch.unwrap_or(0),
            partition_count: partition_count.unwrap_or(1).max(1),
            owners: parse_owners(owners),
            ..Default::default()
        };
        for (member, alive) in members.into_iter().zip(flags) {
            if alive {
                snapshot.alive.insert(member);
            } else {
                snapshot.dead.insert(member);
            }
        }
        Ok(snapshot)
    }

    pub async fn commit_ownership(&self, service: &str, change: &OwnershipChange) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = COMMIT_OWNERSHIP.prepare_invoke();
        invocation
            .key(keys::owners_epoch(service))
            .key(keys::owners(service))
            .key(keys::consumers(service))
            .arg(change.expected_epoch)
            .arg(&change.consumer_id)
            .arg(change.grants.len())
            .arg(change.releases.len());
        for partition in change.grants.iter().chain(&change.releases) {
            invocation.arg(*partition);
        }
        for consumer in &change.dead {
            invocation.arg(consumer);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }
}

fn parse_owners(raw: HashMap<String, String>) -> BTreeMap<u32, String> {
    raw.into_iter()
        .filter_map(|(partition, owner)| partition.parse().ok().map(|p| (p, owner)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_owners_skips_garbage() {
        let raw = HashMap::from([
            ("0".to_string(), "a".to_string()),
            ("2".to_string(), "b".to_string()),
            ("x".to_string(), "c".to_string()),
        ]);
        let owners = parse_owners(raw);
        assert_eq!(owners.len(), 2);
        assert_eq!(owners[&0], "a");
        assert_eq!(owners[&2], "b");
    }
}
