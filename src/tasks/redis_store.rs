use super::{TaskError, TaskRecord, TaskStore, cancel_record, start_record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use uuid::Uuid;

const KEY_PREFIX: &str = "buysmart:task";

/// Sets `KEYS[1]` to `ARGV[2]` with TTL `ARGV[3]` only if it still holds `ARGV[1]`.
const SWAP_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return 1
end
return 0
";
const SWAP_ATTEMPTS: usize = 5;

/// Task records as JSON strings with a TTL, plus a per-user id list.
#[derive(Clone)]
pub struct RedisTaskStore {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisTaskStore {
    pub fn new(client: redis::Client, ttl_secs: u64) -> Self {
        Self {
            client,
            ttl_secs: ttl_secs.max(1),
        }
    }

    async fn conn(&self) -> Result<MultiplexedConnection, TaskError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)
    }

    async fn put(
        &self,
        conn: &mut MultiplexedConnection,
        record: &TaskRecord,
    ) -> Result<(), TaskError> {
        let _: () = conn
            .set_ex(record_key(record.id), encode(record)?, self.ttl_secs)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        id: Uuid,
    ) -> Result<Option<TaskRecord>, TaskError> {
        let raw: Option<String> = conn.get(record_key(id)).await.map_err(backend)?;
        raw.as_deref().map(decode).transpose()
    }

    /// Read, change, compare-and-set. Re-reads when another writer replaced
    /// the record in between; `change` returns `false` to leave it alone.
    async fn swap<F>(&self, id: Uuid, mut change: F) -> Result<Option<TaskRecord>, TaskError>
    where
        F: FnMut(&mut TaskRecord) -> Result<bool, TaskError> + Send,
    {
        let mut conn = self.conn().await?;
        let key = record_key(id);
        let script = redis::Script::new(SWAP_SCRIPT);
        for _ in 0..SWAP_ATTEMPTS {
            let raw: Option<String> = conn.get(&key).await.map_err(backend)?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            let mut record = decode(&raw)?;
            if !change(&mut record)? {
                return Ok(None);
            }
            let swapped: i64 = script
                .key(&key)
                .arg(&raw)
                .arg(encode(&record)?)
                .arg(self.ttl_secs)
                .invoke_async(&mut conn)
                .await
                .map_err(backend)?;
            if swapped == 1 {
                return Ok(Some(record));
            }
        }
        Err(TaskError::Backend(format!(
            "task {id} kept changing during update"
        )))
    }
}

fn encode(record: &TaskRecord) -> Result<String, TaskError> {
    serde_json::to_string(record).map_err(|err| TaskError::Backend(err.to_string()))
}

fn decode(raw: &str) -> Result<TaskRecord, TaskError> {
    serde_json::from_str(raw).map_err(|err| TaskError::Backend(err.to_string()))
}

fn record_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}:{id}")
}

fn user_key(user_id: Uuid) -> String {
    format!("{KEY_PREFIX}s:{user_id}")
}

fn backend(err: redis::RedisError) -> TaskError {
    TaskError::Backend(err.to_string())
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let mut conn = self.conn().await?;
        self.put(&mut conn, record).await?;
        let index = user_key(record.user_id);
        let _: i64 = conn
            .lpush(&index, record.id.to_string())
            .await
            .map_err(backend)?;
        let _: bool = conn
            .expire(&index, self.ttl_secs as i64)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, TaskError> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, id).await
    }

    async fn update(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let mut conn = self.conn().await?;
        self.put(&mut conn, record).await
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<TaskRecord>, TaskError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .lrange(user_key(user_id), 0, -1)
            .await
            .map_err(backend)?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids.iter().filter_map(|raw| Uuid::parse_str(raw).ok()) {
            // expired records leave stale ids behind
            if let Some(record) = self.load(&mut conn, id).await? {
                rows.push(record);
            }
        }
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<TaskRecord, TaskError> {
        self.swap(id, |record| cancel_record(record, now).map(|()| true))
            .await?
            .ok_or(TaskError::NotFound)
    }

    async fn start(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<TaskRecord>, TaskError> {
        self.swap(id, |record| Ok(start_record(record, now))).await
    }
}
