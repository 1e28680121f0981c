use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Distributed Cache Args ---
    /// Distributed cache backend type (redis, memory)
    #[arg(long, env = "CACHE_TYPE", default_value = "redis")]
    pub cache_type: String,

    /// Distributed cache host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "CACHE_HOST", default_value = "redis://127.0.0.1:6379")]
    pub cache_host: String,

    /// Namespace prepended to every derived cache key.
    #[arg(long, env = "CACHE_KEY_PREFIX", default_value = "chat")]
    pub cache_key_prefix: String,

    /// Batch size for the SCAN command used by pattern deletion.
    #[arg(long, env = "CACHE_SCAN_COUNT", default_value = "100")]
    pub cache_scan_count: usize,

    // --- Local Cache Args ---
    /// Maximum number of conversation records held in the process-local cache.
    #[arg(long, env = "LOCAL_CACHE_CAPACITY", default_value = "100")]
    pub local_cache_capacity: usize,

    // --- Durable Store Args ---
    /// Durable object store type (qdrant, memory)
    #[arg(long, env = "STORE_TYPE", default_value = "qdrant")]
    pub store_type: String,

    /// Durable object store host endpoint (e.g., http://localhost:6334)
    #[arg(long, env = "STORE_HOST", default_value = "http://localhost:6334")]
    pub store_host: String,

    /// Optional API key for the durable store instance.
    #[arg(long, env = "STORE_API_KEY")]
    pub store_api_key: Option<String>,

    /// Prefix for durable store collection names (e.g., chat_conversations).
    #[arg(long, env = "STORE_COLLECTION_PREFIX", default_value = "chat")]
    pub store_collection_prefix: String,

    /// Per-call timeout in seconds for durable store operations.
    #[arg(long, env = "STORE_TIMEOUT_SECS", default_value = "30")]
    pub store_timeout_secs: u64,

    // --- Retention Args ---
    /// Time-to-live in seconds for cached conversation metadata (30 days).
    #[arg(long, env = "METADATA_TTL_SECS", default_value = "2592000")]
    pub metadata_ttl_secs: u64,

    /// Time-to-live in seconds for cached message lists (7 days).
    #[arg(long, env = "MESSAGE_TTL_SECS", default_value = "604800")]
    pub message_ttl_secs: u64,

    /// Time-to-live in seconds for cached per-user conversation listings.
    #[arg(long, env = "USER_CACHE_TTL_SECS", default_value = "3600")]
    pub user_cache_ttl_secs: u64,

    /// Time-to-live in seconds for share tokens (7 days).
    #[arg(long, env = "SHARE_TOKEN_TTL_SECS", default_value = "604800")]
    pub share_token_ttl_secs: u64,

    /// Maximum messages retained per conversation list in the distributed cache.
    #[arg(long, env = "MAX_MESSAGES_PER_CONVERSATION", default_value = "500")]
    pub max_messages_per_conversation: usize,

    /// Maximum recent messages retained in each tree-wide activity list.
    #[arg(long, env = "TREE_CONTEXT_DEPTH", default_value = "50")]
    pub tree_context_depth: usize,

    // --- Background Writer Args ---
    /// Number of background workers applying post-response cache writes.
    #[arg(long, env = "CACHE_WRITER_WORKERS", default_value = "5")]
    pub cache_writer_workers: usize,

    /// Queue depth for pending background cache writes; writes beyond this are dropped.
    #[arg(long, env = "CACHE_WRITER_QUEUE_DEPTH", default_value = "256")]
    pub cache_writer_queue_depth: usize,
}
