use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::{BoundedSpec, BoundedStore, CollectionInfo, EnsureOutcome, RecordStream};
use crate::config::{RedisConfig, StoreConfig};
use crate::models::{Record, RecordId};
use crate::{Error, Result};

/// Append, account and evict in one round trip.
///
/// KEYS[1] stream, KEYS[2] meta hash, KEYS[3] set of retained ids.
/// ARGV[1] record json, ARGV[2] size, ARGV[3] record id.
const INSERT_SCRIPT: &str = r"
local cap = tonumber(redis.call('HGET', KEYS[2], 'capacity_bytes'))
local max = tonumber(redis.call('HGET', KEYS[2], 'max_count'))
if redis.call('HGET', KEYS[2], 'bounded') ~= '1' or not cap or not max then
  return redis.error_reply('NOTBOUNDED collection is not bounded')
end
local size = tonumber(ARGV[2])
if size > cap then
  return redis.error_reply('TOOLARGE ' .. cap)
end
if redis.call('SADD', KEYS[3], ARGV[3]) == 0 then
  return redis.error_reply('DUPLICATE ' .. ARGV[3])
end
local id = redis.call('XADD', KEYS[1], '*', 'record', ARGV[1], 'size', ARGV[2], 'rid', ARGV[3])
local bytes = redis.call('HINCRBY', KEYS[2], 'bytes', size)
local count = redis.call('XLEN', KEYS[1])
while count > 0 and (bytes > cap or count > max) do
  local oldest = redis.call('XRANGE', KEYS[1], '-', '+', 'COUNT', 1)[1]
  if not oldest then break end
  local fields = oldest[2]
  local evicted = 0
  for i = 1, #fields, 2 do
    if fields[i] == 'size' then evicted = tonumber(fields[i + 1]) end
    if fields[i] == 'rid' then redis.call('SREM', KEYS[3], fields[i + 1]) end
  end
  redis.call('XDEL', KEYS[1], oldest[1])
  bytes = redis.call('HINCRBY', KEYS[2], 'bytes', -evicted)
  count = count - 1
end
return id
";

/// Bounded store on top of Redis Streams
///
/// Each collection is a stream (`{prefix}store:{name}`) plus a hash
/// (`{prefix}store:{name}:meta`) holding its limits and current byte
/// total. Inserts run [`INSERT_SCRIPT`] so eviction is atomic with the
/// append. Tail cursors use a dedicated connection and blocking `XREAD`.
pub struct RedisStreamStore {
    client: RedisClient,
    conn: ConnectionManager,
    key_prefix: String,
    operation_timeout: Duration,
    connect_timeout: Duration,
    tail_block_ms: u64,
    tail_batch_size: usize,
    insert_script: redis::Script,
}

impl RedisStreamStore {
    pub async fn connect(redis: &RedisConfig, store: &StoreConfig) -> Result<Self> {
        let client = RedisClient::open(redis.url.as_str())?;
        let conn = timeout(redis.connect_timeout(), ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        debug!(url = %redis.url, "Connected bounded store to Redis");

        Ok(Self {
            client,
            conn,
            key_prefix: redis.key_prefix.clone(),
            operation_timeout: redis.operation_timeout(),
            connect_timeout: redis.connect_timeout(),
            tail_block_ms: store.tail_block_ms,
            tail_batch_size: store.tail_batch_size,
            insert_script: redis::Script::new(INSERT_SCRIPT),
        })
    }

    fn stream_key(&self, collection: &str) -> String {
        format!("{}store:{}", self.key_prefix, collection)
    }

    fn meta_key(&self, collection: &str) -> String {
        format!("{}store:{}:meta", self.key_prefix, collection)
    }

    fn ids_key(&self, collection: &str) -> String {
        format!("{}store:{}:ids", self.key_prefix, collection)
    }

    async fn run<T>(
        &self,
        what: &str,
        fut: impl Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T> {
        timeout(self.operation_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("Redis {what} timed out")))?
            .map_err(Error::from)
    }

    async fn read_meta(&self, collection: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let key = self.meta_key(collection);
        self.run("HGETALL", conn.hgetall(&key)).await
    }

    async fn key_type(&self, collection: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let key = self.stream_key(collection);
        self.run::<String>("TYPE", redis::cmd("TYPE").arg(&key).query_async(&mut conn))
            .await
    }
}

fn bounds_from_meta(collection: &str, meta: &HashMap<String, String>) -> Option<BoundedSpec> {
    if meta.get("bounded").map(String::as_str) != Some("1") {
        return None;
    }
    let capacity_bytes = meta.get("capacity_bytes")?.parse().ok()?;
    let max_count = meta.get("max_count")?.parse().ok()?;
    Some(BoundedSpec::new(collection, capacity_bytes, max_count))
}

fn record_from_entry(entry: &StreamId) -> Option<Record> {
    let json = entry.get::<String>("record")?;
    match Record::from_json(&json) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(entry_id = %entry.id, error = %e, "Skipping unreadable store entry");
            None
        }
    }
}

struct TailState {
    conn: MultiplexedConnection,
    stream_key: String,
    meta_key: String,
    collection: String,
    last_id: String,
    pending: VecDeque<Record>,
    block_ms: u64,
    batch_size: usize,
    operation_timeout: Duration,
    done: bool,
}

impl TailState {
    /// One blocking read. `Ok(())` with nothing queued means the block
    /// period elapsed without new entries.
    async fn fill(&mut self) -> Result<()> {
        let options = StreamReadOptions::default()
            .block(self.block_ms as usize)
            .count(self.batch_size);
        let deadline = Duration::from_millis(self.block_ms) + self.operation_timeout;

        let reply: Option<StreamReadReply> = match timeout(
            deadline,
            self.conn
                .xread_options(&[&self.stream_key], &[&self.last_id], &options),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            // Response timeout shorter than the block period; treat as idle
            Ok(Err(e)) if e.is_timeout() => None,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "tail read on '{}' timed out",
                    self.collection
                )))
            }
        };

        match reply {
            Some(reply) => {
                for stream in reply.keys {
                    for entry in stream.ids {
                        self.last_id.clone_from(&entry.id);
                        if let Some(record) = record_from_entry(&entry) {
                            self.pending.push_back(record);
                        }
                    }
                }
            }
            None => {
                let exists: bool = timeout(self.operation_timeout, self.conn.exists(&self.meta_key))
                    .await
                    .map_err(|_| Error::Timeout("Redis EXISTS timed out".to_string()))??;
                if !exists {
                    return Err(Error::CursorInvalidated(format!(
                        "collection '{}' was dropped",
                        self.collection
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BoundedStore for RedisStreamStore {
    async fn ensure_bounded(&self, spec: &BoundedSpec) -> Result<EnsureOutcome> {
        let meta = self.read_meta(&spec.name).await?;
        if bounds_from_meta(&spec.name, &meta).as_ref() == Some(spec) {
            return Ok(EnsureOutcome::AlreadyBounded);
        }

        let existed = !meta.is_empty() || self.key_type(&spec.name).await? != "none";
        let stream_key = self.stream_key(&spec.name);
        let meta_key = self.meta_key(&spec.name);
        let ids_key = self.ids_key(&spec.name);
        let fields = [
            ("bounded", "1".to_string()),
            ("capacity_bytes", spec.capacity_bytes.to_string()),
            ("max_count", spec.max_count.to_string()),
            ("bytes", "0".to_string()),
        ];

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&stream_key)
            .del(&meta_key)
            .del(&ids_key)
            .hset_multiple(&meta_key, &fields);
        self.run::<()>("ensure bounded", pipe.query_async(&mut conn))
            .await?;

        debug!(collection = %spec.name, existed, "Configured bounded collection");
        Ok(if existed {
            EnsureOutcome::Recreated
        } else {
            EnsureOutcome::Created
        })
    }

    async fn insert(&self, collection: &str, mut record: Record) -> Result<Record> {
        let id = record.id.get_or_insert_with(RecordId::new).clone();
        if id.as_str().is_empty() {
            return Err(Error::InvalidRecord("record id must not be empty".to_string()));
        }
        let json = record.to_json()?;
        let size = json.len();

        let mut conn = self.conn.clone();
        let mut invocation = self.insert_script.prepare_invoke();
        invocation
            .key(self.stream_key(collection))
            .key(self.meta_key(collection))
            .key(self.ids_key(collection))
            .arg(&json)
            .arg(size)
            .arg(id.as_str());

        match self
            .run::<String>("insert", invocation.invoke_async(&mut conn))
            .await
        {
            Ok(entry_id) => {
                debug!(collection, entry_id = %entry_id, size, "Inserted record");
                Ok(record)
            }
            Err(Error::Redis(e)) if e.code() == Some("NOTBOUNDED") => Err(Error::NotBounded(
                format!("collection '{collection}' is not bounded"),
            )),
            Err(Error::Redis(e)) if e.code() == Some("TOOLARGE") => Err(Error::RecordTooLarge {
                size,
                capacity: e.detail().and_then(|d| d.trim().parse().ok()).unwrap_or_default(),
            }),
            Err(Error::Redis(e)) if e.code() == Some("DUPLICATE") => {
                Err(Error::DuplicateId(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn tail(&self, collection: &str) -> Result<RecordStream> {
        let meta = self.read_meta(collection).await?;
        if bounds_from_meta(collection, &meta).is_none() {
            return Err(Error::NotBounded(format!(
                "collection '{collection}' cannot be tailed"
            )));
        }

        let mut conn = timeout(self.connect_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        let stream_key = self.stream_key(collection);
        let tip: StreamRangeReply = timeout(
            self.operation_timeout,
            conn.xrevrange_count(&stream_key, "+", "-", 1usize),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XREVRANGE timed out".to_string()))??;
        let last_id = tip
            .ids
            .into_iter()
            .next()
            .map_or_else(|| "0-0".to_string(), |entry| entry.id);

        debug!(collection, last_id = %last_id, "Opened tail cursor");

        let state = TailState {
            conn,
            stream_key,
            meta_key: self.meta_key(collection),
            collection: collection.to_string(),
            last_id,
            pending: VecDeque::new(),
            block_ms: self.tail_block_ms.max(1),
            batch_size: self.tail_batch_size.max(1),
            operation_timeout: self.operation_timeout,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                if let Some(record) = state.pending.pop_front() {
                    return Some((Ok(record), state));
                }
                if let Err(e) = state.fill().await {
                    state.done = true;
                    return Some((Err(e), state));
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn snapshot(&self, collection: &str) -> Result<Vec<Record>> {
        let mut conn = self.conn.clone();
        let key = self.stream_key(collection);
        let reply: StreamRangeReply = self.run("XRANGE", conn.xrange_all(&key)).await?;
        Ok(reply.ids.iter().filter_map(record_from_entry).collect())
    }

    async fn describe(&self, collection: &str) -> Result<Option<CollectionInfo>> {
        let meta = self.read_meta(collection).await?;
        let kind = self.key_type(collection).await?;
        if meta.is_empty() && kind == "none" {
            return Ok(None);
        }

        let mut conn = self.conn.clone();
        let key = self.stream_key(collection);
        let count: u64 = if kind == "stream" {
            self.run("XLEN", conn.xlen(&key)).await?
        } else {
            0
        };

        Ok(Some(CollectionInfo {
            name: collection.to_string(),
            bounds: bounds_from_meta(collection, &meta),
            count,
            bytes: meta
                .get("bytes")
                .and_then(|b| b.parse().ok())
                .unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    async fn store() -> RedisStreamStore {
        let redis = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: format!("capstream-test:{}:", nanoid::nanoid!(8)),
            ..RedisConfig::default()
        };
        let store = StoreConfig {
            tail_block_ms: 200,
            ..StoreConfig::default()
        };
        RedisStreamStore::connect(&redis, &store).await.unwrap()
    }

    fn person(id: &str) -> Record {
        Record::from_value(json!({"id": id, "name": "Ada", "job": "Engineer"})).unwrap()
    }

    #[test]
    fn test_bounds_from_meta() {
        let mut meta = HashMap::new();
        assert!(bounds_from_meta("persons", &meta).is_none());

        meta.insert("bounded".to_string(), "1".to_string());
        meta.insert("capacity_bytes".to_string(), "1024".to_string());
        meta.insert("max_count".to_string(), "10".to_string());
        assert_eq!(
            bounds_from_meta("persons", &meta),
            Some(BoundedSpec::new("persons", 1024, 10))
        );

        meta.insert("bounded".to_string(), "0".to_string());
        assert!(bounds_from_meta("persons", &meta).is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_ensure_insert_and_evict() {
        let store = store().await;
        let spec = BoundedSpec::new("persons", 1024 * 1024, 2);

        assert_eq!(store.ensure_bounded(&spec).await.unwrap(), EnsureOutcome::Created);
        assert_eq!(
            store.ensure_bounded(&spec).await.unwrap(),
            EnsureOutcome::AlreadyBounded
        );

        for id in ["p1", "p2", "p3"] {
            store.insert("persons", person(id)).await.unwrap();
        }

        let kept: Vec<_> = store
            .snapshot("persons")
            .await
            .unwrap()
            .iter()
            .map(|r| r.key().to_string())
            .collect();
        assert_eq!(kept, vec!["p2", "p3"]);

        let info = store.describe("persons").await.unwrap().unwrap();
        assert_eq!(info.count, 2);
        assert!(info.is_bounded_as(&spec));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_rejects_retained_and_empty_ids() {
        let store = store().await;
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024 * 1024, 2))
            .await
            .unwrap();

        store.insert("persons", person("p1")).await.unwrap();
        let err = store.insert("persons", person("p1")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "p1"));
        assert!(matches!(
            store.insert("persons", person("")).await,
            Err(Error::InvalidRecord(_))
        ));

        // Evicting p1 frees its id
        store.insert("persons", person("p2")).await.unwrap();
        store.insert("persons", person("p3")).await.unwrap();
        store.insert("persons", person("p1")).await.unwrap();
        assert_eq!(store.describe("persons").await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_insert_into_missing_collection() {
        let store = store().await;
        let err = store.insert("nowhere", person("p1")).await.unwrap_err();
        assert!(matches!(err, Error::NotBounded(_)));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_tail_follows_new_records() {
        let store = store().await;
        store
            .ensure_bounded(&BoundedSpec::new("persons", 1024 * 1024, 100))
            .await
            .unwrap();
        store.insert("persons", person("before")).await.unwrap();

        let mut tail = store.tail("persons").await.unwrap();
        store.insert("persons", person("p1")).await.unwrap();
        store.insert("persons", person("p2")).await.unwrap();

        for expected in ["p1", "p2"] {
            let record = timeout(Duration::from_secs(5), tail.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(record.key(), expected);
        }
    }
}
