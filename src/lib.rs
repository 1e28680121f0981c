pub mod cache;
pub mod config;
pub mod context;
pub mod deletion;
pub mod error;
pub mod hierarchy;
pub mod models;
pub mod service;
pub mod store;

use log::{ info, warn };

pub use config::Args;
pub use error::{ ChatStoreError, Result };
pub use models::{ ChatMessage, Conversation, ContextEntry, HierarchyStats, ShareToken };
pub use service::ChatStore;

/// Builds a ready-to-use `ChatStore` from configuration, logging the
/// effective settings and probing both backends once.
pub async fn init(args: Args) -> Result<ChatStore> {
    info!("--- Chat Store Configuration ---");
    info!("Distributed Cache Type: {}", args.cache_type);
    info!("Distributed Cache Host: {}", args.cache_host);
    info!("Cache Key Prefix: {}", args.cache_key_prefix);
    info!("Local Cache Capacity: {}", args.local_cache_capacity);
    info!("Durable Store Type: {}", args.store_type);
    info!("Durable Store Host: {}", args.store_host);
    info!("Store Timeout: {}s", args.store_timeout_secs);
    info!("Metadata TTL: {}s", args.metadata_ttl_secs);
    info!("Message TTL: {}s", args.message_ttl_secs);
    info!("Max Messages Per Conversation: {}", args.max_messages_per_conversation);
    info!("Cache Writer Workers: {}", args.cache_writer_workers);
    info!("--------------------------------");

    let store = ChatStore::new(&args)?;
    if !store.cache_healthy().await {
        warn!("Distributed cache is unreachable; reads fall through to the durable store");
    }
    if !store.store_healthy().await {
        warn!("Durable store is unreachable; only cached data is served until it returns");
    }
    Ok(store)
}
