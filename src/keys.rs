//! Key encoding for cache entries and analytics buckets
//!
//! Key formats:
//! - simple entries: `<SCOPE>::<OPERATION>_<joined-args>`, e.g. `INTERNAL::SET_BOOK_42`
//! - analytics buckets: `<PREFIX>_<KIND>_<id>`, e.g. `SET_INTERNAL_ANALYTICS_BOOK_7`

use crate::model::EntityKind;

/// Encodes and decodes store keys for one deployment (scope and prefix come from config)
#[derive(Debug, Clone)]
pub struct KeyEncoder {
    scope: String,
    analytics_prefix: String,
}

impl KeyEncoder {
    pub fn new(scope: impl Into<String>, analytics_prefix: impl Into<String>) -> Self {
        KeyEncoder {
            scope: scope.into(),
            analytics_prefix: analytics_prefix.into(),
        }
    }

    /// Format: `<SCOPE>::<OPERATION>_<arg1,arg2,...>`
    pub fn encode(&self, operation: &str, args: &[&str]) -> String {
        let joined = args.join(",");
        let mut key = String::with_capacity(self.scope.len() + operation.len() + joined.len() + 3);
        key.push_str(&self.scope);
        key.push_str("::");
        key.push_str(operation);
        key.push('_');
        key.push_str(&joined);
        key
    }

    /// Primary entry holding the full serialized entity
    pub fn entity(&self, kind: EntityKind, id: u64) -> String {
        self.encode(&format!("SET_{}", kind.tag()), &[&id.to_string()])
    }

    /// Secondary entry keyed by the natural key (books: copy count by ISBN).
    ///
    /// Uses its own operation name so an all-digit natural key never lands on a primary key.
    pub fn natural(&self, kind: EntityKind, natural_key: &str) -> String {
        self.encode(&format!("SET_{}_COPIES", kind.tag()), &[natural_key])
    }

    /// Ranked-counter bucket for one entity
    pub fn analytics(&self, kind: EntityKind, id: u64) -> String {
        format!("{}_{}_{}", self.analytics_prefix, kind.tag(), id)
    }

    /// Decode an analytics bucket key back to `(kind, id)`
    pub fn decode_analytics(&self, key: &str) -> Option<(EntityKind, u64)> {
        let rest = key.strip_prefix(&self.analytics_prefix)?.strip_prefix('_')?;
        let (tag, id) = rest.rsplit_once('_')?;
        let kind = match tag {
            "BOOK" => EntityKind::Book,
            "MEMBER" => EntityKind::Member,
            "LOAN" => EntityKind::Loan,
            _ => return None,
        };
        Some((kind, id.parse().ok()?))
    }
}

impl Default for KeyEncoder {
    fn default() -> Self {
        KeyEncoder::new("INTERNAL", "SET_INTERNAL_ANALYTICS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_simple_entry() {
        let keys = KeyEncoder::default();
        assert_eq!(keys.encode("SET_BOOK", &["42"]), "INTERNAL::SET_BOOK_42");
        assert_eq!(keys.encode("LOOKUP", &["a", "b"]), "INTERNAL::LOOKUP_a,b");
        assert_eq!(keys.entity(EntityKind::Member, 3), "INTERNAL::SET_MEMBER_3");
    }

    #[test]
    fn test_natural_key_never_collides_with_primary() {
        let keys = KeyEncoder::default();
        assert_ne!(
            keys.entity(EntityKind::Book, 42),
            keys.natural(EntityKind::Book, "42")
        );
    }

    #[test]
    fn test_analytics_roundtrip() {
        let keys = KeyEncoder::default();
        let key = keys.analytics(EntityKind::Book, 7);
        assert_eq!(key, "SET_INTERNAL_ANALYTICS_BOOK_7");
        assert_eq!(keys.decode_analytics(&key), Some((EntityKind::Book, 7)));
        assert_eq!(keys.decode_analytics("SET_OTHER_BOOK_7"), None);
        assert_eq!(keys.decode_analytics("SET_INTERNAL_ANALYTICS_BOOK_x"), None);
    }
}
