//! Key-Value Store Abstraction
//!
//! A thin, trait-based seam over a networked TTL key-value store that also speaks a
//! probabilistic-set command pair (`BF.ADD`/`BF.EXISTS`) and an ordered-set command pair
//! (`ZINCRBY`/`ZRANGE ... WITHSCORES`).
//!
//! Every call goes through [`KeyValueStore::execute`], which runs a [`Batch`] as one atomic
//! group: either every command applies or none does. Single-command helpers are provided
//! on the trait for convenience.
//!
//! Replies are not matched by runtime casting. Each command pushed onto a batch returns a
//! typed [`Slot`], and [`BatchReplies::take`] converts the reply into that slot's type.
//!
//! Implementations:
//! - `InMemoryStore`: for unit tests and the demo binary
//! - `SimulatedStore`: wraps another store and injects faults
//! - `RedisStore`: Redis (with RedisBloom) over a pooled connection (feature `redis-store`)

mod bloom;
mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;
mod simulated;
mod sorted_set;

pub use bloom::{BloomFilter, ScalableBloomFilter};
pub use memory::{ExpiryReaper, InMemoryStore};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use simulated::{SimulatedStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use sorted_set::RankedSet;

use crate::error::StoreError;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to a store, used by every component of the core
pub type SharedStore = Arc<dyn KeyValueStore>;

/// One wire command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    Exists {
        key: String,
    },
    PTtl {
        key: String,
    },
    BfReserve {
        filter: String,
        error_rate: f64,
        capacity: u64,
    },
    BfAdd {
        filter: String,
        item: String,
    },
    BfExists {
        filter: String,
        item: String,
    },
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
    ZRange {
        key: String,
        start: isize,
        stop: isize,
        rev: bool,
    },
}

impl Command {
    /// The key the command operates on (filter name for `BF.*`)
    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Del { key }
            | Command::Exists { key }
            | Command::PTtl { key }
            | Command::ZIncrBy { key, .. }
            | Command::ZRange { key, .. } => key,
            Command::BfReserve { filter, .. }
            | Command::BfAdd { filter, .. }
            | Command::BfExists { filter, .. } => filter,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::PTtl { .. } => "PTTL",
            Command::BfReserve { .. } => "BF.RESERVE",
            Command::BfAdd { .. } => "BF.ADD",
            Command::BfExists { .. } => "BF.EXISTS",
            Command::ZIncrBy { .. } => "ZINCRBY",
            Command::ZRange { rev: false, .. } => "ZRANGE",
            Command::ZRange { rev: true, .. } => "ZREVRANGE",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::Get { .. }
                | Command::Exists { .. }
                | Command::PTtl { .. }
                | Command::BfExists { .. }
                | Command::ZRange { .. }
        )
    }
}

/// A ranked-set member with its score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Remaining lifetime of a key, as reported by `PTTL`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Raw reply to one command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Bulk(Option<Bytes>),
    Integer(i64),
    Bool(bool),
    Score(f64),
    Ranked(Vec<ScoredMember>),
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::Ok => "ok",
            Reply::Bulk(_) => "bulk",
            Reply::Integer(_) => "integer",
            Reply::Bool(_) => "bool",
            Reply::Score(_) => "score",
            Reply::Ranked(_) => "ranked",
        }
    }
}

/// Conversion from a raw reply into the type a [`Slot`] promises
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> Result<Self, StoreError>;
}

fn unexpected<T>(expected: &str, reply: &Reply) -> Result<T, StoreError> {
    Err(StoreError::Protocol(format!(
        "expected {} reply, got {}",
        expected,
        reply.kind()
    )))
}

impl FromReply for () {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Ok | Reply::Bool(_) | Reply::Integer(_) => Ok(()),
            other => unexpected("status", &other),
        }
    }
}

impl FromReply for Option<Bytes> {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Bulk(value) => Ok(value),
            other => unexpected("bulk", &other),
        }
    }
}

impl FromReply for bool {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Bool(b) => Ok(b),
            Reply::Integer(n) => Ok(n > 0),
            other => unexpected("boolean", &other),
        }
    }
}

impl FromReply for i64 {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Integer(n) => Ok(n),
            other => unexpected("integer", &other),
        }
    }
}

impl FromReply for f64 {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Score(s) => Ok(s),
            Reply::Integer(n) => Ok(n as f64),
            other => unexpected("score", &other),
        }
    }
}

impl FromReply for Vec<ScoredMember> {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Ranked(members) => Ok(members),
            other => unexpected("ranked", &other),
        }
    }
}

impl FromReply for Ttl {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Integer(-2) => Ok(Ttl::Missing),
            Reply::Integer(-1) => Ok(Ttl::Persistent),
            Reply::Integer(ms) if ms >= 0 => Ok(Ttl::Expires(Duration::from_millis(ms as u64))),
            other => unexpected("pttl", &other),
        }
    }
}

/// Typed handle to one command's reply inside a batch
pub struct Slot<T> {
    index: usize,
    _reply: PhantomData<fn() -> T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("index", &self.index).finish()
    }
}

/// An ordered group of commands executed atomically
#[derive(Debug, Clone, Default)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Batch {
            commands: Vec::new(),
        }
    }

    fn push<T: FromReply>(&mut self, command: Command) -> Slot<T> {
        self.commands.push(command);
        Slot {
            index: self.commands.len() - 1,
            _reply: PhantomData,
        }
    }

    pub fn get(&mut self, key: impl Into<String>) -> Slot<Option<Bytes>> {
        self.push(Command::Get { key: key.into() })
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Slot<()> {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        })
    }

    /// Reply is true when a key was removed
    pub fn del(&mut self, key: impl Into<String>) -> Slot<bool> {
        self.push(Command::Del { key: key.into() })
    }

    pub fn exists(&mut self, key: impl Into<String>) -> Slot<bool> {
        self.push(Command::Exists { key: key.into() })
    }

    pub fn pttl(&mut self, key: impl Into<String>) -> Slot<Ttl> {
        self.push(Command::PTtl { key: key.into() })
    }

    pub fn bf_reserve(
        &mut self,
        filter: impl Into<String>,
        error_rate: f64,
        capacity: u64,
    ) -> Slot<()> {
        self.push(Command::BfReserve {
            filter: filter.into(),
            error_rate,
            capacity,
        })
    }

    /// Reply is true when the item was not (possibly) present before
    pub fn bf_add(&mut self, filter: impl Into<String>, item: impl Into<String>) -> Slot<bool> {
        self.push(Command::BfAdd {
            filter: filter.into(),
            item: item.into(),
        })
    }

    pub fn bf_exists(&mut self, filter: impl Into<String>, item: impl Into<String>) -> Slot<bool> {
        self.push(Command::BfExists {
            filter: filter.into(),
            item: item.into(),
        })
    }

    /// Reply is the member's new score
    pub fn zincr_by(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        delta: f64,
    ) -> Slot<f64> {
        self.push(Command::ZIncrBy {
            key: key.into(),
            member: member.into(),
            delta,
        })
    }

    /// Members by ascending score, ranks `start..=stop` (negative ranks count from the end)
    pub fn zrange_with_scores(
        &mut self,
        key: impl Into<String>,
        start: isize,
        stop: isize,
    ) -> Slot<Vec<ScoredMember>> {
        self.push(Command::ZRange {
            key: key.into(),
            start,
            stop,
            rev: false,
        })
    }

    /// Members by descending score, ranks `start..=stop`
    pub fn zrevrange_with_scores(
        &mut self,
        key: impl Into<String>,
        start: isize,
        stop: isize,
    ) -> Slot<Vec<ScoredMember>> {
        self.push(Command::ZRange {
            key: key.into(),
            start,
            stop,
            rev: true,
        })
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Replies of an executed batch, consumed slot by slot
#[derive(Debug)]
pub struct BatchReplies {
    replies: Vec<Option<Reply>>,
}

impl BatchReplies {
    pub fn new(replies: Vec<Reply>) -> Self {
        BatchReplies {
            replies: replies.into_iter().map(Some).collect(),
        }
    }

    /// Take the reply for `slot`, converted to the slot's type
    pub fn take<T: FromReply>(&mut self, slot: Slot<T>) -> Result<T, StoreError> {
        let reply = self
            .replies
            .get_mut(slot.index)
            .and_then(Option::take)
            .ok_or_else(|| {
                StoreError::Protocol(format!("no reply for command #{}", slot.index))
            })?;
        T::from_reply(reply)
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

fn single<'a, S, T>(
    store: &'a S,
    batch: Batch,
    slot: Slot<T>,
) -> BoxFuture<'a, Result<T, StoreError>>
where
    S: KeyValueStore + ?Sized,
    T: FromReply + Send + 'a,
{
    async move { store.execute(batch).await?.take(slot) }.boxed()
}

/// Key-value store abstraction trait
///
/// Implementations must apply a batch atomically with respect to other batches on the
/// same store handle, and must surface I/O errors without retrying.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Execute every command in `batch` as one atomic group.
    fn execute(&self, batch: Batch) -> BoxFuture<'_, Result<BatchReplies, StoreError>>;

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Bytes>, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.get(key);
        single(self, batch, slot)
    }

    fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.set(key, value, ttl);
        single(self, batch, slot)
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.del(key);
        single(self, batch, slot)
    }

    fn exists(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.exists(key);
        single(self, batch, slot)
    }

    fn pttl(&self, key: &str) -> BoxFuture<'_, Result<Ttl, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.pttl(key);
        single(self, batch, slot)
    }

    fn add_to_set(&self, filter: &str, item: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.bf_add(filter, item);
        single(self, batch, slot)
    }

    fn set_contains(&self, filter: &str, item: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.bf_exists(filter, item);
        single(self, batch, slot)
    }

    fn increment_ranked(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> BoxFuture<'_, Result<f64, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.zincr_by(key, member, delta);
        single(self, batch, slot)
    }

    fn range_ranked(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> BoxFuture<'_, Result<Vec<ScoredMember>, StoreError>> {
        let mut batch = Batch::new();
        let slot = batch.zrange_with_scores(key, start, stop);
        single(self, batch, slot)
    }
}
