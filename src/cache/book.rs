use super::{CacheStats, CachedEntity, EntityCache};
use crate::context::RequestContext;
use crate::model::{Book, Entity};
use bytes::Bytes;
use tracing::warn;

pub type BookCache = EntityCache<Book>;

impl CachedEntity for Book {
    /// Copy count keyed by ISBN, kept longer than the payload
    fn secondary_record(&self) -> Option<(&str, Bytes)> {
        Some((&self.isbn, Bytes::from(self.available_copies.to_string())))
    }
}

impl EntityCache<Book> {
    /// Cached copy count for an ISBN. None on miss, store error or a malformed record.
    pub async fn available_copies(&self, ctx: &RequestContext, isbn: &str) -> Option<i64> {
        let key = self.keys.natural(Book::KIND, isbn);
        match ctx.run(self.store.get(&key)).await {
            Ok(Some(raw)) => match std::str::from_utf8(&raw).ok().and_then(|s| s.parse().ok()) {
                Some(copies) => Some(copies),
                None => {
                    CacheStats::bump(&self.stats.decode_failures);
                    warn!(isbn, key = %key, "malformed copy-count record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.stats.record_degraded();
                warn!(isbn, error = %e, "copy-count lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::cache_over;
    use crate::clock::SimulatedClock;
    use crate::store::{InMemoryStore, KeyValueStore, SharedStore, Ttl};
    use std::sync::Arc;
    use std::time::Duration;

    fn book(id: u64) -> Book {
        let mut book = Book::new("Dune", "Frank Herbert", "978-0441013593").with_copies(4);
        book.id = id;
        book
    }

    #[tokio::test]
    async fn test_store_writes_payload_copy_count_and_filter() {
        let store: SharedStore = Arc::new(InMemoryStore::new(Arc::new(SimulatedClock::new(0))));
        let cache: BookCache = cache_over(store.clone(), "books:isbn");
        let ctx = RequestContext::background();

        cache.store(&ctx, &book(42)).await.unwrap();

        assert_eq!(cache.get(&ctx, 42).await, Some(book(42)));
        assert_eq!(cache.available_copies(&ctx, "978-0441013593").await, Some(4));
        assert!(!cache.is_unique(&ctx, "978-0441013593").await);
        assert!(cache.is_unique(&ctx, "978-0000000000").await);

        let Ttl::Expires(copies_ttl) = store
            .pttl("INTERNAL::SET_BOOK_COPIES_978-0441013593")
            .await
            .unwrap()
        else {
            panic!("copy count must carry a ttl");
        };
        assert!(copies_ttl >= Duration::from_secs(4 * 3600));
    }

    #[tokio::test]
    async fn test_delete_keeps_filter_entry() {
        let store: SharedStore = Arc::new(InMemoryStore::new(Arc::new(SimulatedClock::new(0))));
        let cache: BookCache = cache_over(store, "books:isbn");
        let ctx = RequestContext::background();

        cache.store(&ctx, &book(42)).await.unwrap();
        assert!(cache.exists(&ctx, 42).await);
        assert!(cache.delete(&ctx, 42).await.unwrap());

        assert!(!cache.exists(&ctx, 42).await);
        assert_eq!(cache.get(&ctx, 42).await, None);
        assert!(!cache.is_unique(&ctx, "978-0441013593").await);
    }

    #[tokio::test]
    async fn test_malformed_copy_count_is_miss() {
        let store: SharedStore = Arc::new(InMemoryStore::new(Arc::new(SimulatedClock::new(0))));
        let cache: BookCache = cache_over(store.clone(), "books:isbn");
        let ctx = RequestContext::background();

        store
            .set("INTERNAL::SET_BOOK_COPIES_x", Bytes::from_static(b"many"), None)
            .await
            .unwrap();
        assert_eq!(cache.available_copies(&ctx, "x").await, None);
        assert_eq!(cache.available_copies(&ctx, "missing").await, None);
    }
}
