use thiserror::Error;

pub type Result<T, E = ChatStoreError> = std::result::Result<T, E>;

/// Errors surfaced by the storage core. Availability kinds
/// (`StoreUnavailable`, `CacheUnavailable`) are degraded-mode signals and are
/// normally absorbed close to where they occur rather than returned to
/// callers; an unreachable backend is never reported as "not found".
#[derive(Error, Debug)]
pub enum ChatStoreError {
    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("distributed cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("hierarchy walk from '{start}' exceeded {hops} hops (cycle or excessive depth)")]
    CycleOrExcessiveDepth { start: String, hops: u32 },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for ChatStoreError {
    fn from(err: redis::RedisError) -> Self {
        ChatStoreError::CacheUnavailable(err.to_string())
    }
}

impl From<qdrant_client::QdrantError> for ChatStoreError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        ChatStoreError::StoreUnavailable(err.to_string())
    }
}
