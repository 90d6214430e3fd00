//! Redis-backed store
//!
//! Talks to Redis with the RedisBloom module loaded. A multi-command batch is sent as a
//! MULTI/EXEC pipeline over a reconnecting `ConnectionManager`, single commands are sent
//! bare. Unlike `InMemoryStore`, Redis only rejects a whole transaction for errors found
//! while queueing; a runtime WRONGTYPE fails that command and the rest still apply.

use super::{Batch, BatchReplies, Command, KeyValueStore, Reply, ScoredMember};
use crate::error::StoreError;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use redis::aio::ConnectionManager;
use redis::Value;
use tracing::info;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `redis://host:port/db`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to redis key-value store");
        Ok(RedisStore { conn })
    }
}

fn build_pipeline(batch: &Batch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    if batch.len() > 1 {
        pipe.atomic();
    }

    for command in batch.commands() {
        match command {
            Command::Get { key } => {
                pipe.cmd("GET").arg(key);
            }
            Command::Set { key, value, ttl } => {
                pipe.cmd("SET").arg(key).arg(value.as_ref());
                if let Some(ttl) = ttl {
                    pipe.arg("PX").arg(ttl.as_millis() as u64);
                }
            }
            Command::Del { key } => {
                pipe.cmd("DEL").arg(key);
            }
            Command::Exists { key } => {
                pipe.cmd("EXISTS").arg(key);
            }
            Command::PTtl { key } => {
                pipe.cmd("PTTL").arg(key);
            }
            Command::BfReserve {
                filter,
                error_rate,
                capacity,
            } => {
                pipe.cmd("BF.RESERVE").arg(filter).arg(*error_rate).arg(*capacity);
            }
            Command::BfAdd { filter, item } => {
                pipe.cmd("BF.ADD").arg(filter).arg(item);
            }
            Command::BfExists { filter, item } => {
                pipe.cmd("BF.EXISTS").arg(filter).arg(item);
            }
            Command::ZIncrBy { key, member, delta } => {
                pipe.cmd("ZINCRBY").arg(key).arg(*delta).arg(member);
            }
            Command::ZRange {
                key,
                start,
                stop,
                rev,
            } => {
                let name = if *rev { "ZREVRANGE" } else { "ZRANGE" };
                pipe.cmd(name).arg(key).arg(*start).arg(*stop).arg("WITHSCORES");
            }
        }
    }

    pipe
}

fn protocol(command: &Command, value: &Value) -> StoreError {
    StoreError::Protocol(format!("{} returned {:?}", command.name(), value))
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn score(value: &Value) -> Option<f64> {
    match value {
        Value::Double(d) => Some(*d),
        Value::Int(n) => Some(*n as f64),
        other => text(other)?.parse().ok(),
    }
}

/// Accepts the RESP2 flat `[m, s, m, s]` form and the RESP3 `[[m, s], ...]` form.
fn scored_members(command: &Command, value: &Value) -> Result<Vec<ScoredMember>, StoreError> {
    let Value::Array(items) = value else {
        return Err(protocol(command, value));
    };

    let pair = |member: &Value, s: &Value| -> Result<ScoredMember, StoreError> {
        match (text(member), score(s)) {
            (Some(member), Some(score)) => Ok(ScoredMember { member, score }),
            _ => Err(protocol(command, value)),
        }
    };

    if items.iter().all(|item| matches!(item, Value::Array(_))) {
        items
            .iter()
            .map(|item| match item {
                Value::Array(p) if p.len() == 2 => pair(&p[0], &p[1]),
                _ => Err(protocol(command, value)),
            })
            .collect()
    } else if items.len() % 2 == 0 {
        items.chunks(2).map(|p| pair(&p[0], &p[1])).collect()
    } else {
        Err(protocol(command, value))
    }
}

fn convert(command: &Command, value: Value) -> Result<Reply, StoreError> {
    let reply = match (command, &value) {
        (Command::Get { .. }, Value::Nil) => Reply::Bulk(None),
        (Command::Get { .. }, Value::BulkString(bytes)) => {
            Reply::Bulk(Some(Bytes::from(bytes.clone())))
        }
        (Command::Set { .. } | Command::BfReserve { .. }, Value::Okay | Value::SimpleString(_)) => {
            Reply::Ok
        }
        (Command::Del { .. } | Command::Exists { .. } | Command::PTtl { .. }, Value::Int(n)) => {
            Reply::Integer(*n)
        }
        (Command::BfAdd { .. } | Command::BfExists { .. }, Value::Int(n)) => Reply::Bool(*n != 0),
        (Command::BfAdd { .. } | Command::BfExists { .. }, Value::Boolean(b)) => Reply::Bool(*b),
        (Command::ZIncrBy { .. }, other) => {
            Reply::Score(score(other).ok_or_else(|| protocol(command, &value))?)
        }
        (Command::ZRange { .. }, _) => Reply::Ranked(scored_members(command, &value)?),
        _ => return Err(protocol(command, &value)),
    };
    Ok(reply)
}

/// RedisBloom answers `ERR item exists` when `BF.RESERVE` finds the filter in place
fn server_error(batch: &Batch, err: redis::RedisError) -> StoreError {
    if err.code() == Some("ERR") && err.detail() == Some("item exists") {
        let reserved = batch.commands().iter().find_map(|command| match command {
            Command::BfReserve { filter, .. } => Some(filter.clone()),
            _ => None,
        });
        if let Some(key) = reserved {
            return StoreError::KeyExists { key };
        }
    }
    err.into()
}

impl KeyValueStore for RedisStore {
    fn execute(&self, batch: Batch) -> BoxFuture<'_, Result<BatchReplies, StoreError>> {
        let mut conn = self.conn.clone();

        async move {
            if batch.is_empty() {
                return Ok(BatchReplies::new(Vec::new()));
            }

            let pipe = build_pipeline(&batch);
            let values: Vec<Value> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| server_error(&batch, e))?;
            if values.len() != batch.len() {
                return Err(StoreError::Protocol(format!(
                    "expected {} replies, got {}",
                    batch.len(),
                    values.len()
                )));
            }

            let replies = batch
                .commands()
                .iter()
                .zip(values)
                .map(|(command, value)| convert(command, value))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(BatchReplies::new(replies))
        }
        .boxed()
    }
}
