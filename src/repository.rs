//! Source-of-truth seam
//!
//! The relational store lives outside this crate. `Repository` is the boundary it is
//! reached through; `InMemoryRepository` stands in for it in tests and the demo.

use crate::error::RepositoryError;
use crate::model::Entity;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One page of a keyset scan
#[derive(Debug, Clone, PartialEq)]
pub struct Page<E> {
    pub items: Vec<E>,
    /// Pass back as `cursor` for the next page; None when exhausted
    pub next_cursor: Option<u64>,
}

/// CRUD over one entity kind, keyed by numeric id
pub trait Repository<E: Entity>: Send + Sync + 'static {
    /// Insert and return the entity with its assigned id
    fn create(&self, entity: E) -> BoxFuture<'_, Result<E, RepositoryError>>;

    fn find_by_id(&self, id: u64) -> BoxFuture<'_, Result<Option<E>, RepositoryError>>;

    fn find_by_natural_key(&self, key: &str) -> BoxFuture<'_, Result<Option<E>, RepositoryError>>;

    /// Replace an existing entity
    fn save(&self, entity: E) -> BoxFuture<'_, Result<E, RepositoryError>>;

    /// Returns false if nothing was deleted
    fn delete(&self, id: u64) -> BoxFuture<'_, Result<bool, RepositoryError>>;

    /// Entities with id greater than `cursor`, ascending by id
    fn find_page(
        &self,
        cursor: Option<u64>,
        page_size: usize,
    ) -> BoxFuture<'_, Result<Page<E>, RepositoryError>>;
}

pub type SharedRepository<E> = Arc<dyn Repository<E>>;

/// Map-backed repository enforcing natural-key uniqueness like a unique index would
pub struct InMemoryRepository<E> {
    rows: RwLock<BTreeMap<u64, E>>,
    next_id: AtomicU64,
}

impl<E: Entity> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn new() -> Self {
        InMemoryRepository {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn conflicts(rows: &BTreeMap<u64, E>, entity: &E) -> Option<String> {
        let key = entity.natural_key()?;
        rows.values()
            .any(|row| row.id() != entity.id() && row.natural_key() == Some(key))
            .then(|| format!("{} with key '{}' already exists", E::KIND, key))
    }

    fn create_now(&self, mut entity: E) -> Result<E, RepositoryError> {
        let mut rows = self.rows.write();
        entity.set_id(0);
        if let Some(reason) = Self::conflicts(&rows, &entity) {
            return Err(RepositoryError::Conflict(reason));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entity.set_id(id);
        rows.insert(id, entity.clone());
        Ok(entity)
    }

    fn save_now(&self, entity: E) -> Result<E, RepositoryError> {
        let mut rows = self.rows.write();
        if !rows.contains_key(&entity.id()) {
            return Err(RepositoryError::NotFound {
                kind: E::KIND,
                id: entity.id(),
            });
        }
        if let Some(reason) = Self::conflicts(&rows, &entity) {
            return Err(RepositoryError::Conflict(reason));
        }
        rows.insert(entity.id(), entity.clone());
        Ok(entity)
    }

    fn page_now(&self, cursor: Option<u64>, page_size: usize) -> Page<E> {
        let rows = self.rows.read();
        let start = cursor.map_or(0, |c| c.saturating_add(1));
        let items: Vec<E> = rows.range(start..).take(page_size).map(|(_, e)| e.clone()).collect();
        let has_more = |last: &E| rows.range(last.id() + 1..).next().is_some();
        let next_cursor = match items.last() {
            Some(last) if items.len() == page_size && has_more(last) => Some(last.id()),
            _ => None,
        };
        Page { items, next_cursor }
    }
}

impl<E: Entity> Repository<E> for InMemoryRepository<E> {
    fn create(&self, entity: E) -> BoxFuture<'_, Result<E, RepositoryError>> {
        futures::future::ready(self.create_now(entity)).boxed()
    }

    fn find_by_id(&self, id: u64) -> BoxFuture<'_, Result<Option<E>, RepositoryError>> {
        futures::future::ready(Ok(self.rows.read().get(&id).cloned())).boxed()
    }

    fn find_by_natural_key(&self, key: &str) -> BoxFuture<'_, Result<Option<E>, RepositoryError>> {
        let found = self
            .rows
            .read()
            .values()
            .find(|row| row.natural_key() == Some(key))
            .cloned();
        futures::future::ready(Ok(found)).boxed()
    }

    fn save(&self, entity: E) -> BoxFuture<'_, Result<E, RepositoryError>> {
        futures::future::ready(self.save_now(entity)).boxed()
    }

    fn delete(&self, id: u64) -> BoxFuture<'_, Result<bool, RepositoryError>> {
        futures::future::ready(Ok(self.rows.write().remove(&id).is_some())).boxed()
    }

    fn find_page(
        &self,
        cursor: Option<u64>,
        page_size: usize,
    ) -> BoxFuture<'_, Result<Page<E>, RepositoryError>> {
        futures::future::ready(Ok(self.page_now(cursor, page_size))).boxed()
    }
}
