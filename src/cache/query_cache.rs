//! TTL + LRU query cache with similarity lookup.

use crate::types::TableView;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// A prior result judged close enough to a new query.
#[derive(Clone, Debug)]
pub struct SimilarHit {
    /// The earlier query text that produced the result.
    pub query: String,
    /// Similarity score in `[0, 1]`; `1.0` for an exact match.
    pub similarity: f64,
    pub result: TableView,
}

/// Narrow seam to a "find similar prior result" backend.
///
/// `scope` partitions results (the store passes branch and table) so a
/// result is only ever offered for the data it was computed from.
pub trait SimilarResultFinder: Send + Sync {
    /// Best prior result for `query` within `scope`, if any is similar enough.
    fn find_similar(&self, scope: &str, query: &str) -> Option<SimilarHit>;

    /// Remember `result` as the answer to `query` within `scope`.
    fn record(&self, scope: &str, query: &str, result: TableView);
}

/// Query cache configuration.
#[derive(Clone, Debug)]
pub struct QueryCacheConfig {
    /// Maximum cached results.
    pub capacity: usize,
    /// How long a result stays usable.
    pub ttl: Duration,
    /// Minimum similarity for a non-exact hit.
    pub similarity_threshold: f64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
            similarity_threshold: 0.8,
        }
    }
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub exact_hits: u64,
    pub similar_hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheEntry {
    result: TableView,
    inserted: Instant,
}

type CacheKey = (String, String);

/// Default in-process [`SimilarResultFinder`].
pub struct QueryCache {
    config: QueryCacheConfig,
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    /// Recently recorded queries, for the redundancy rate.
    history: Mutex<VecDeque<String>>,
    exact_hits: AtomicU64,
    similar_hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(config: QueryCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
            history: Mutex::new(VecDeque::new()),
            exact_hits: AtomicU64::new(0),
            similar_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    /// Drop every cached result and the query history.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.history.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            similar_hits: self.similar_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    /// Share of recorded queries that closely resemble an earlier one.
    pub fn redundancy_rate(&self) -> f64 {
        let history = self.history.lock();
        if history.len() < 2 {
            return 0.0;
        }

        let redundant = history
            .iter()
            .enumerate()
            .filter(|(i, query)| {
                history
                    .iter()
                    .take(*i)
                    .any(|earlier| similarity(query, earlier) >= self.config.similarity_threshold)
            })
            .count();

        redundant as f64 / history.len() as f64
    }

    fn expired(&self, entry: &CacheEntry) -> bool {
        entry.inserted.elapsed() >= self.config.ttl
    }

    fn miss(&self) -> Option<SimilarHit> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }
}

impl SimilarResultFinder for QueryCache {
    fn find_similar(&self, scope: &str, query: &str) -> Option<SimilarHit> {
        let mut entries = self.entries.lock();
        let key = (scope.to_string(), query.to_string());

        if let Some(entry) = entries.get(&key) {
            if !self.expired(entry) {
                self.exact_hits.fetch_add(1, Ordering::Relaxed);
                return Some(SimilarHit {
                    query: query.to_string(),
                    similarity: 1.0,
                    result: entry.result.clone(),
                });
            }
            entries.pop(&key);
            trace!(scope, query, "expired cached result");
        }

        let best = entries
            .iter()
            .filter(|((entry_scope, _), entry)| entry_scope == scope && !self.expired(entry))
            .map(|((_, cached_query), _)| (similarity(query, cached_query), cached_query.clone()))
            .filter(|(score, _)| *score >= self.config.similarity_threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        let Some((score, cached_query)) = best else {
            return self.miss();
        };

        // Promote the matched entry.
        let matched_key = (scope.to_string(), cached_query);
        let result = entries.get(&matched_key).map(|entry| entry.result.clone())?;
        self.similar_hits.fetch_add(1, Ordering::Relaxed);
        trace!(scope, query, matched = %matched_key.1, score, "similar cached result");

        Some(SimilarHit {
            query: matched_key.1,
            similarity: score,
            result,
        })
    }

    fn record(&self, scope: &str, query: &str, result: TableView) {
        self.entries.lock().put(
            (scope.to_string(), query.to_string()),
            CacheEntry {
                result,
                inserted: Instant::now(),
            },
        );

        let mut history = self.history.lock();
        history.push_back(query.to_string());
        while history.len() > self.config.capacity.max(1) {
            history.pop_front();
        }
    }
}

/// Token-set Jaccard similarity of two queries, case-insensitive.
pub fn similarity(a: &str, b: &str) -> f64 {
    fn tokens(s: &str) -> BTreeSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let shared = a.intersection(&b).count();
    let total = a.union(&b).count();
    shared as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BranchId, Version};
    use serde_json::json;
    use std::sync::Arc;

    fn view(price: f64) -> TableView {
        TableView {
            branch: BranchId::main(),
            table: "products".into(),
            version: Version(1),
            rows: Arc::new(vec![json!({"id": 1, "price": price})]),
        }
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("Average price", "average PRICE"), 1.0);
        assert_eq!(similarity("a b", "c d"), 0.0);
        let score = similarity("average price of products", "average price of all products");
        assert!(score >= 0.8, "score was {}", score);
    }

    #[test]
    fn test_exact_hit() {
        let cache = QueryCache::new(QueryCacheConfig::default());
        cache.record("main/products", "avg price", view(1.0));

        let hit = cache.find_similar("main/products", "avg price").unwrap();
        assert_eq!(hit.similarity, 1.0);
        assert_eq!(hit.result, view(1.0));
        assert_eq!(cache.stats().exact_hits, 1);
    }

    #[test]
    fn test_similar_hit_and_scope_isolation() {
        let cache = QueryCache::new(QueryCacheConfig::default());
        cache.record("main/products", "average price of products", view(1.0));

        let hit = cache
            .find_similar("main/products", "average price of all products")
            .unwrap();
        assert_eq!(hit.query, "average price of products");
        assert!(hit.similarity < 1.0);

        assert!(cache
            .find_similar("branch_1/products", "average price of products")
            .is_none());
        let stats = cache.stats();
        assert_eq!(stats.similar_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = QueryCache::new(QueryCacheConfig {
            ttl: Duration::ZERO,
            ..Default::default()
        });
        cache.record("s", "q", view(1.0));

        assert!(cache.find_similar("s", "q").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_lru_capacity() {
        let cache = QueryCache::new(QueryCacheConfig {
            capacity: 2,
            ..Default::default()
        });
        cache.record("s", "alpha", view(1.0));
        cache.record("s", "beta", view(2.0));
        cache.record("s", "gamma", view(3.0));

        assert_eq!(cache.stats().entries, 2);
        assert!(cache.find_similar("s", "alpha").is_none());
        assert!(cache.find_similar("s", "gamma").is_some());
    }

    #[test]
    fn test_redundancy_rate() {
        let cache = QueryCache::new(QueryCacheConfig::default());
        assert_eq!(cache.redundancy_rate(), 0.0);

        cache.record("s", "total sales by region", view(1.0));
        cache.record("s", "Total sales by region", view(1.0));
        cache.record("s", "top customers", view(1.0));
        cache.record("s", "inventory levels", view(1.0));

        assert_eq!(cache.redundancy_rate(), 0.25);

        cache.clear();
        assert_eq!(cache.redundancy_rate(), 0.0);
        assert_eq!(cache.stats().entries, 0);
    }
}
