use log::{ debug, warn };
use std::collections::hash_map::DefaultHasher;
use std::hash::{ Hash, Hasher };
use std::sync::Arc;
use tokio::sync::{ mpsc, oneshot };

use crate::cache::{ CacheOp, DistributedCache };

/// One post-response cache write, applied by a background worker. A write
/// with no ops acts as a barrier: its ack proves every earlier write on the
/// same shard has been applied.
struct CacheWrite {
    label: &'static str,
    ops: Vec<CacheOp>,
    ack: Option<oneshot::Sender<()>>,
}

/// Sharded background appliers for post-response cache writes. Writes with
/// the same shard key go to the same worker and apply in submission order;
/// different shards proceed independently. Failures are logged and dropped,
/// since the durable store already holds the data.
pub struct CacheWriterPool {
    senders: Vec<mpsc::Sender<CacheWrite>>,
}

impl CacheWriterPool {
    /// Spawns the workers onto the current Tokio runtime.
    pub fn new(worker_count: usize, queue_depth: usize, cache: Arc<dyn DistributedCache>) -> Self {
        let worker_count = worker_count.max(1);
        let queue_depth = queue_depth.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<CacheWrite>(queue_depth);
            let cache = cache.clone();
            tokio::spawn(async move {
                while let Some(write) = rx.recv().await {
                    if !write.ops.is_empty() {
                        let results = cache.pipeline(write.ops).await;
                        if results.iter().any(|ok| !ok) {
                            debug!("Background {} write incomplete on writer {}", write.label, worker);
                        }
                    }
                    if let Some(ack) = write.ack {
                        let _ = ack.send(());
                    }
                }
                debug!("Cache writer {} stopped", worker);
            });
            senders.push(tx);
        }
        Self { senders }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Hands a batch of cache ops to the pool. A full queue drops the write.
    pub fn enqueue(&self, shard_key: &str, label: &'static str, ops: Vec<CacheOp>) {
        if ops.is_empty() {
            return;
        }
        let index = self.shard_index(shard_key);
        let write = CacheWrite { label, ops, ack: None };
        if let Err(e) = self.senders[index].try_send(write) {
            warn!("Dropping background {} cache write: {}", label, e);
        }
    }

    /// Waits until every write enqueued before this call has been applied, on
    /// all shards. Deletion runs this ahead of its purge, so a write queued
    /// earlier cannot land afterwards and revive what the purge removed.
    pub async fn drain(&self) {
        let mut pending = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (tx, rx) = oneshot::channel();
            let barrier = CacheWrite { label: "drain", ops: Vec::new(), ack: Some(tx) };
            // Barriers must not be dropped on a full queue; wait for room.
            if sender.send(barrier).await.is_ok() {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
    }

    fn shard_index(&self, shard_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        shard_key.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;

    fn set_op(key: &str, value: &str) -> Vec<CacheOp> {
        vec![CacheOp::Set { key: key.to_string(), value: value.to_string(), ttl: None }]
    }

    #[tokio::test]
    async fn same_shard_writes_apply_in_submission_order() {
        let cache = Arc::new(MemoryCache::new());
        let pool = CacheWriterPool::new(3, 32, cache.clone() as Arc<dyn DistributedCache>);
        for i in 0..10 {
            pool.enqueue("conv-1", "test", set_op("k", &format!("v{}", i)));
        }
        pool.drain().await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v9"));
    }

    #[tokio::test]
    async fn drain_applies_everything_already_queued() {
        let cache = Arc::new(MemoryCache::new());
        let pool = CacheWriterPool::new(2, 32, cache.clone() as Arc<dyn DistributedCache>);
        pool.enqueue("a", "test", set_op("ka", "va"));
        pool.enqueue("b", "test", set_op("kb", "vb"));
        pool.drain().await;
        // No sleeping; drain alone must be enough.
        assert_eq!(cache.get("ka").await.as_deref(), Some("va"));
        assert_eq!(cache.get("kb").await.as_deref(), Some("vb"));
    }

    #[tokio::test]
    async fn worker_count_is_never_zero() {
        let cache = Arc::new(MemoryCache::new());
        let pool = CacheWriterPool::new(0, 0, cache as Arc<dyn DistributedCache>);
        assert_eq!(pool.worker_count(), 1);
        pool.drain().await;
    }
}
