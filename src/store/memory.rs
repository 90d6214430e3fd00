//! In-memory store with lazy and active expiry
//!
//! Batches run under one lock. Every command in a batch is type-checked against the
//! state the batch would see before any of them is applied, so a rejected batch leaves
//! the store untouched (EXEC semantics without the WATCH machinery).

use super::bloom::ScalableBloomFilter;
use super::sorted_set::RankedSet;
use super::{Batch, BatchReplies, Command, KeyValueStore, Reply, ScoredMember};
use crate::clock::{SharedClock, Timestamp};
use crate::error::StoreError;
use ahash::AHashMap;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Filter parameters used when `BF.ADD` creates a filter that was never reserved
pub const DEFAULT_FILTER_CAPACITY: u64 = 100;
pub const DEFAULT_FILTER_ERROR_RATE: f64 = 0.01;

#[derive(Debug, Clone)]
enum Value {
    String(Bytes),
    Bloom(ScalableBloomFilter),
    Ranked(RankedSet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    String,
    Bloom,
    Ranked,
}

impl Value {
    fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Bloom(_) => ValueKind::Bloom,
            Value::Ranked(_) => ValueKind::Ranked,
        }
    }
}

fn expect_kind(key: &str, current: Option<ValueKind>, want: ValueKind) -> Result<(), StoreError> {
    match current {
        Some(kind) if kind != want => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct StoreState {
    data: AHashMap<String, Value>,
    expirations: AHashMap<String, Timestamp>,
    commands_processed: u64,
    filter_capacity: u64,
    filter_error_rate: f64,
}

impl StoreState {
    fn is_expired(&self, key: &str, now: Timestamp) -> bool {
        match self.expirations.get(key) {
            Some(expiration) => *expiration <= now,
            None => false,
        }
    }

    fn purge_if_expired(&mut self, key: &str, now: Timestamp) {
        if self.is_expired(key, now) {
            self.data.remove(key);
            self.expirations.remove(key);
        }
    }

    fn live_kind(&self, key: &str, now: Timestamp) -> Option<ValueKind> {
        if self.is_expired(key, now) {
            return None;
        }
        self.data.get(key).map(Value::kind)
    }

    /// Validate a whole batch against the state it would see, without mutating anything.
    fn check(&self, commands: &[Command], now: Timestamp) -> Result<(), StoreError> {
        let mut planned: AHashMap<&str, Option<ValueKind>> = AHashMap::new();

        for command in commands {
            let key = command.key();
            let current = match planned.get(key) {
                Some(kind) => *kind,
                None => self.live_kind(key, now),
            };

            let next = match command {
                Command::Get { .. } => {
                    expect_kind(key, current, ValueKind::String)?;
                    current
                }
                Command::Set { ttl, .. } => {
                    if *ttl == Some(Duration::ZERO) {
                        return Err(StoreError::Response(
                            "ERR invalid expire time in 'set' command".to_string(),
                        ));
                    }
                    Some(ValueKind::String)
                }
                Command::Del { .. } => None,
                Command::Exists { .. } | Command::PTtl { .. } => current,
                Command::BfReserve {
                    error_rate,
                    capacity,
                    ..
                } => {
                    if !(*error_rate > 0.0 && *error_rate < 1.0) {
                        return Err(StoreError::Response(
                            "ERR (0 < error rate range < 1)".to_string(),
                        ));
                    }
                    if *capacity == 0 {
                        return Err(StoreError::Response(
                            "ERR (capacity should be larger than 0)".to_string(),
                        ));
                    }
                    if current.is_some() {
                        return Err(StoreError::KeyExists {
                            key: key.to_string(),
                        });
                    }
                    Some(ValueKind::Bloom)
                }
                Command::BfAdd { .. } => {
                    expect_kind(key, current, ValueKind::Bloom)?;
                    Some(ValueKind::Bloom)
                }
                Command::BfExists { .. } => {
                    expect_kind(key, current, ValueKind::Bloom)?;
                    current
                }
                Command::ZIncrBy { delta, .. } => {
                    expect_kind(key, current, ValueKind::Ranked)?;
                    if delta.is_nan() {
                        return Err(StoreError::Response(
                            "ERR value is not a valid float".to_string(),
                        ));
                    }
                    Some(ValueKind::Ranked)
                }
                Command::ZRange { .. } => {
                    expect_kind(key, current, ValueKind::Ranked)?;
                    current
                }
            };
            planned.insert(key, next);
        }

        Ok(())
    }

    fn apply(&mut self, command: &Command, now: Timestamp) -> Result<Reply, StoreError> {
        let key = command.key();
        self.purge_if_expired(key, now);
        let wrong_type = || StoreError::WrongType {
            key: key.to_string(),
        };

        let reply = match command {
            Command::Get { .. } => match self.data.get(key) {
                Some(Value::String(value)) => Reply::Bulk(Some(value.clone())),
                Some(_) => return Err(wrong_type()),
                None => Reply::Bulk(None),
            },
            Command::Set { value, ttl, .. } => {
                self.data.insert(key.to_string(), Value::String(value.clone()));
                match ttl {
                    Some(ttl) => {
                        self.expirations.insert(key.to_string(), now + *ttl);
                    }
                    None => {
                        self.expirations.remove(key);
                    }
                }
                Reply::Ok
            }
            Command::Del { .. } => {
                self.expirations.remove(key);
                Reply::Integer(self.data.remove(key).is_some() as i64)
            }
            Command::Exists { .. } => Reply::Integer(self.data.contains_key(key) as i64),
            Command::PTtl { .. } => {
                if !self.data.contains_key(key) {
                    Reply::Integer(-2)
                } else {
                    match self.expirations.get(key) {
                        Some(expiration) => {
                            Reply::Integer(expiration.saturating_sub(now).as_millis() as i64)
                        }
                        None => Reply::Integer(-1),
                    }
                }
            }
            Command::BfReserve {
                error_rate,
                capacity,
                ..
            } => {
                self.data.insert(
                    key.to_string(),
                    Value::Bloom(ScalableBloomFilter::new(*capacity, *error_rate)),
                );
                Reply::Ok
            }
            Command::BfAdd { item, .. } => {
                let (capacity, error_rate) = (self.filter_capacity, self.filter_error_rate);
                let value = self
                    .data
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        Value::Bloom(ScalableBloomFilter::new(capacity, error_rate))
                    });
                match value {
                    Value::Bloom(filter) => Reply::Bool(filter.insert(item.as_bytes())),
                    _ => return Err(wrong_type()),
                }
            }
            Command::BfExists { item, .. } => match self.data.get(key) {
                Some(Value::Bloom(filter)) => Reply::Bool(filter.contains(item.as_bytes())),
                Some(_) => return Err(wrong_type()),
                None => Reply::Bool(false),
            },
            Command::ZIncrBy { member, delta, .. } => {
                let value = self
                    .data
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Ranked(RankedSet::new()));
                match value {
                    Value::Ranked(set) => Reply::Score(set.incr_by(member, *delta)),
                    _ => return Err(wrong_type()),
                }
            }
            Command::ZRange {
                start, stop, rev, ..
            } => match self.data.get(key) {
                Some(Value::Ranked(set)) => {
                    let range = if *rev {
                        set.rev_range(*start, *stop)
                    } else {
                        set.range(*start, *stop)
                    };
                    Reply::Ranked(
                        range
                            .into_iter()
                            .map(|(member, score)| ScoredMember { member, score })
                            .collect(),
                    )
                }
                Some(_) => return Err(wrong_type()),
                None => Reply::Ranked(Vec::new()),
            },
        };

        Ok(reply)
    }

    fn evict_expired(&mut self, now: Timestamp) -> usize {
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, expiration)| **expiration <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.data.remove(key);
            self.expirations.remove(key);
        }

        debug_assert!(
            self.expirations.keys().all(|k| self.data.contains_key(k)),
            "Invariant violated: expiration without data"
        );
        expired.len()
    }
}

/// Process-local store. Clones share the same data.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: SharedClock,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("keys", &self.state.lock().data.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        InMemoryStore {
            state: Arc::new(Mutex::new(StoreState {
                data: AHashMap::new(),
                expirations: AHashMap::new(),
                commands_processed: 0,
                filter_capacity: DEFAULT_FILTER_CAPACITY,
                filter_error_rate: DEFAULT_FILTER_ERROR_RATE,
            })),
            clock,
        }
    }

    /// Parameters for filters auto-created by `BF.ADD`
    pub fn with_filter_defaults(self, capacity: u64, error_rate: f64) -> Self {
        {
            let mut state = self.state.lock();
            state.filter_capacity = capacity;
            state.filter_error_rate = error_rate;
        }
        self
    }

    /// Run a batch synchronously.
    pub fn execute_now(&self, batch: &Batch) -> Result<BatchReplies, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.check(batch.commands(), now)?;

        let mut replies = Vec::with_capacity(batch.len());
        for command in batch.commands() {
            replies.push(state.apply(command, now)?);
        }
        state.commands_processed += batch.len() as u64;
        Ok(BatchReplies::new(replies))
    }

    /// Drop every key whose expiry has passed. Returns the number evicted.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        self.state.lock().evict_expired(now)
    }

    /// Keys currently held, including expired keys not yet evicted
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn commands_processed(&self) -> u64 {
        self.state.lock().commands_processed
    }

    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.data.clear();
        state.expirations.clear();
    }
}

impl KeyValueStore for InMemoryStore {
    fn execute(&self, batch: Batch) -> BoxFuture<'_, Result<BatchReplies, StoreError>> {
        futures::future::ready(self.execute_now(&batch)).boxed()
    }
}

/// Periodically evicts expired keys so memory does not wait on the next read
pub struct ExpiryReaper {
    store: InMemoryStore,
    period: Duration,
}

impl ExpiryReaper {
    pub fn new(store: InMemoryStore, period: Duration) -> Self {
        ExpiryReaper { store, period }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = interval(self.period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("expiry reaper stopping");
                    return;
                }
                _ = tick.tick() => {
                    let evicted = self.store.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "evicted expired keys");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::store::Ttl;

    fn store() -> (InMemoryStore, SimulatedClock) {
        let clock = SimulatedClock::new(1_000);
        (InMemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_set_get_expire() {
        let (store, clock) = store();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(
            store.pttl("k").await.unwrap(),
            Ttl::Expires(Duration::from_secs(10))
        );

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.pttl("k").await.unwrap(), Ttl::Missing);
    }

    #[tokio::test]
    async fn test_set_without_ttl_is_persistent() {
        let (store, _) = store();
        store.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(store.pttl("k").await.unwrap(), Ttl::Persistent);
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_rejects_whole_batch() {
        let (store, _) = store();
        store.set("s", Bytes::from_static(b"v"), None).await.unwrap();

        let mut batch = Batch::new();
        batch.set("fresh", Bytes::from_static(b"1"), None);
        batch.zincr_by("s", "m", 1.0);
        let err = store.execute(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));

        assert!(!store.exists("fresh").await.unwrap(), "no partial apply");
    }

    #[tokio::test]
    async fn test_type_check_follows_batch_order() {
        let (store, _) = store();
        let mut batch = Batch::new();
        batch.zincr_by("k", "m", 1.0);
        batch.del("k");
        let set = batch.set("k", Bytes::from_static(b"v"), None);
        let get = batch.get("k");
        let mut replies = store.execute(batch).await.unwrap();
        replies.take(set).unwrap();
        assert_eq!(replies.take(get).unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_filter_auto_created_and_reserved() {
        let (store, _) = store();
        assert!(!store.set_contains("f", "a").await.unwrap());
        assert!(store.add_to_set("f", "a").await.unwrap());
        assert!(!store.add_to_set("f", "a").await.unwrap());
        assert!(store.set_contains("f", "a").await.unwrap());

        let mut batch = Batch::new();
        batch.bf_reserve("f", 0.01, 1_000);
        let err = store.execute(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyExists { key } if key == "f"));
    }

    #[tokio::test]
    async fn test_ranked_increments() {
        let (store, _) = store();
        store.increment_ranked("z", "2024/3", 1.0).await.unwrap();
        store.increment_ranked("z", "2024/3", 1.0).await.unwrap();
        store.increment_ranked("z", "2024/4", 1.0).await.unwrap();

        let top = store.range_ranked("z", 0, -1).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[1].member, "2024/3");
        assert_eq!(top[1].score, 2.0);
    }

    #[test]
    fn test_active_eviction() {
        let (store, clock) = store();
        let mut batch = Batch::new();
        batch.set("a", Bytes::from_static(b"1"), Some(Duration::from_millis(50)));
        batch.set("b", Bytes::from_static(b"2"), Some(Duration::from_millis(500)));
        batch.set("c", Bytes::from_static(b"3"), None);
        store.execute_now(&batch).unwrap();

        clock.advance_ms(100);
        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.commands_processed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_on_shutdown() {
        let (store, clock) = store();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        clock.advance_ms(20);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            ExpiryReaper::new(store.clone(), Duration::from_millis(100)).run(shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
