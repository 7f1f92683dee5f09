//! Entity cache
//!
//! In-memory, key-addressed store of fetched records with staleness
//! timestamps. Uses Moka for high-performance concurrent caching.
//!
//! Reads past their TTL are served stale while the caller triggers a
//! background refetch (stale-while-revalidate); nothing blocks on a
//! refresh. Invalidation supports exact keys and collection-wide
//! sweeps, and is idempotent in both forms.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use serde_json::Value;

use crate::config::CacheConfig;
use crate::data::models::{Collection, EntityId};

// =============================================================================
// Cache keys
// =============================================================================

/// Key form: a single entity or a canonicalized query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// (collection, id)
    Entity(String),
    /// (collection, canonical filter + order + limit descriptor)
    Query(String),
}

/// Cache key: collection plus entity id or query descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub collection: Collection,
    pub kind: KeyKind,
}

impl CacheKey {
    pub fn entity(collection: Collection, id: &EntityId) -> Self {
        Self {
            collection,
            kind: KeyKind::Entity(id.as_str().to_string()),
        }
    }

    pub fn query(collection: Collection, descriptor: String) -> Self {
        Self {
            collection,
            kind: KeyKind::Query(descriptor),
        }
    }
}

// =============================================================================
// Entries and lookups
// =============================================================================

#[derive(Clone)]
struct CacheEntry {
    value: Arc<Value>,
    fetched_at: Instant,
}

/// Result of a cache read
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Entry present and within its TTL
    Fresh(Arc<Value>),
    /// Entry present but past its TTL; serve it and refetch
    Stale(Arc<Value>),
    Miss,
}

impl Lookup {
    pub fn value(&self) -> Option<Arc<Value>> {
        match self {
            Lookup::Fresh(v) | Lookup::Stale(v) => Some(Arc::clone(v)),
            Lookup::Miss => None,
        }
    }
}

// =============================================================================
// Entity cache
// =============================================================================

/// Shared entity cache (volatile, unbounded apart from TTL refresh)
///
/// Non-authoritative copies of remote records. Shared by all read
/// services, the mutation coordinator (optimistic flips and
/// rollbacks) and the realtime listener (invalidation).
pub struct EntityCache {
    entries: Cache<CacheKey, CacheEntry>,
    ttls: CacheConfig,
}

impl EntityCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = Cache::builder().support_invalidation_closures().build();

        Self {
            entries,
            ttls: config.clone(),
        }
    }

    /// TTL class for a collection
    ///
    /// Message and conversation views go stale faster than the rest;
    /// the values mirror the refresh windows the application relied on.
    fn ttl_for(&self, collection: Collection) -> Duration {
        let seconds = match collection {
            Collection::Conversations => self.ttls.conversations_ttl_seconds,
            Collection::Messages => self.ttls.messages_ttl_seconds,
            _ => self.ttls.default_ttl_seconds,
        };
        Duration::from_secs(seconds)
    }

    /// Read an entry, classifying it as fresh or stale
    pub async fn get(&self, key: &CacheKey) -> Lookup {
        use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

        match self.entries.get(key).await {
            Some(entry) => {
                let stale = entry.fetched_at.elapsed() >= self.ttl_for(key.collection);
                let freshness = if stale { "stale" } else { "fresh" };
                CACHE_HITS_TOTAL
                    .with_label_values(&[key.collection.as_str(), freshness])
                    .inc();
                if stale {
                    Lookup::Stale(entry.value)
                } else {
                    Lookup::Fresh(entry.value)
                }
            }
            None => {
                CACHE_MISSES_TOTAL
                    .with_label_values(&[key.collection.as_str()])
                    .inc();
                Lookup::Miss
            }
        }
    }

    /// Read an entry without hit/miss accounting
    ///
    /// Used for optimistic snapshots, where absence is not a miss.
    pub async fn peek(&self, key: &CacheKey) -> Option<Arc<Value>> {
        self.entries.get(key).await.map(|entry| entry.value)
    }

    /// Insert or replace an entry, stamping it as freshly fetched
    pub async fn put(&self, key: CacheKey, value: Value) -> Arc<Value> {
        let value = Arc::new(value);
        self.entries
            .insert(
                key,
                CacheEntry {
                    value: Arc::clone(&value),
                    fetched_at: Instant::now(),
                },
            )
            .await;

        use crate::metrics::CACHE_SIZE;
        CACHE_SIZE
            .with_label_values(&["entities"])
            .set(self.entries.entry_count() as i64);

        value
    }

    /// Restore a snapshot taken before an optimistic flip
    ///
    /// The snapshot keeps its original fetch time semantics: the
    /// restored entry is stamped now, which only delays the next
    /// background refresh, never serves newer-than-true data.
    pub async fn restore(&self, key: CacheKey, value: Arc<Value>) {
        self.entries
            .insert(
                key,
                CacheEntry {
                    value,
                    fetched_at: Instant::now(),
                },
            )
            .await;
    }

    /// Invalidate an exact key (idempotent)
    pub async fn invalidate(&self, key: &CacheKey) {
        use crate::metrics::CACHE_INVALIDATIONS_TOTAL;
        CACHE_INVALIDATIONS_TOTAL
            .with_label_values(&[key.collection.as_str(), "exact"])
            .inc();
        self.entries.invalidate(key).await;
    }

    /// Invalidate every entry for a collection (idempotent)
    ///
    /// Covers both entity keys and query keys, e.g. dropping all post
    /// list views when any post is created or deleted.
    pub fn invalidate_collection(&self, collection: Collection) {
        use crate::metrics::CACHE_INVALIDATIONS_TOTAL;
        CACHE_INVALIDATIONS_TOTAL
            .with_label_values(&[collection.as_str(), "collection"])
            .inc();
        if let Err(error) = self
            .entries
            .invalidate_entries_if(move |key, _| key.collection == collection)
        {
            tracing::warn!(%error, collection = %collection, "collection invalidation failed");
        }
    }

    /// Current number of entries (after pending housekeeping)
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}
