pub mod keys;
pub mod local;
pub mod memory;
pub mod redis;
pub mod writer;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::config::Args;
use crate::error::{ ChatStoreError, Result };

/// One entry of a non-transactional pipeline. Ops execute in order but there
/// is no cross-key atomicity; callers must treat each result independently.
#[derive(Clone, Debug)]
pub enum CacheOp {
    Set { key: String, value: String, ttl: Option<u64> },
    Delete { key: String },
    ListPush { key: String, value: String },
    ListTrim { key: String, start: isize, stop: isize },
    Expire { key: String, ttl: u64 },
}

/// Shared TTL key/list store. Every operation fails soft (empty result or
/// `false`) when the backend is unreachable; only `health_check` reports
/// reachability, so "cache down" is never confused with "key absent".
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    /// Sets a value, with an expiry when `ttl` is given (seconds).
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> bool;

    /// Refreshes the expiry of an existing key.
    async fn set_ttl(&self, key: &str, ttl: u64) -> bool;

    /// Deletes the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> usize;

    /// Deletes keys matching a glob pattern, returning how many were removed.
    /// Used only as a fallback cleanup path; the pattern bounds the scan.
    async fn delete_matching(&self, pattern: &str) -> usize;

    /// Pushes to the head of a list.
    async fn list_push(&self, key: &str, value: &str) -> bool;

    /// Returns list elements between `start` and `stop` inclusive (head first,
    /// negative indexes count from the tail).
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Vec<String>;

    /// Trims a list to the elements between `start` and `stop` inclusive.
    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> bool;

    /// Runs ops back to back on one connection; one result per op.
    async fn pipeline(&self, ops: Vec<CacheOp>) -> Vec<bool>;

    async fn health_check(&self) -> bool;
}

pub fn create_cache(args: &Args) -> Result<Arc<dyn DistributedCache>> {
    match args.cache_type.to_lowercase().as_str() {
        "redis" => {
            let cache = redis::RedisCache::new(args)?;
            Ok(Arc::new(cache))
        }
        "memory" => Ok(Arc::new(memory::MemoryCache::new())),
        other => Err(ChatStoreError::Validation(
            format!("Unsupported cache type: {}", other)
        )),
    }
}

pub fn initialize_cache(args: &Args) -> Result<Arc<dyn DistributedCache>> {
    info!("Distributed cache backend: {} at {}", args.cache_type, args.cache_host);
    create_cache(args)
}
