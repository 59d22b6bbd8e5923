//! Query result caching.
//!
//! Callers exploring branches tend to ask the same question many times in
//! slightly different words. The store reaches its cache only through
//! [`SimilarResultFinder`], so the default in-process [`QueryCache`] can be
//! swapped for an external semantic search backend.

mod query_cache;

pub use query_cache::{
    similarity, CacheStats, QueryCache, QueryCacheConfig, SimilarHit, SimilarResultFinder,
};
