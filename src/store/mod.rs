pub mod memory;
pub mod qdrant;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::config::Args;
use crate::error::{ ChatStoreError, Result };

/// Object class holding conversation records.
pub const CONVERSATIONS: &str = "conversations";
/// Object class holding message records.
pub const MESSAGES: &str = "messages";

pub type Props = serde_json::Map<String, serde_json::Value>;

/// Authoritative object database. Unlike the cache tiers this surface is not
/// fail-soft: unreachability is an explicit `StoreUnavailable` error so that
/// callers never mistake an outage for confirmed absence (`Ok(None)`).
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Stores a new object and returns its generated id.
    async fn create(&self, class: &str, props: Props) -> Result<String>;

    /// Stores an object under a caller-chosen id. Returns `false` when the
    /// backend cannot address that id.
    async fn create_with_id(&self, class: &str, id: &str, props: Props) -> Result<bool>;

    async fn get(&self, class: &str, id: &str) -> Result<Option<Props>>;

    /// Returns objects whose fields equal every `(field, value)` pair given.
    async fn query(&self, class: &str, filter: &[(&str, &str)], limit: usize) -> Result<Vec<Props>>;

    /// Merges `props` into an existing object's fields.
    async fn update(&self, class: &str, id: &str, props: Props) -> Result<bool>;

    /// Removes an object. Deleting an absent id is not an error.
    async fn delete(&self, class: &str, id: &str) -> Result<bool>;

    async fn health_check(&self) -> bool;
}

pub fn create_store(args: &Args) -> Result<Arc<dyn DurableStore>> {
    match args.store_type.to_lowercase().as_str() {
        "qdrant" => {
            let store = qdrant::QdrantObjectStore::new(args)?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(memory::MemoryObjectStore::new())),
        other => Err(ChatStoreError::Validation(
            format!("Unsupported store type: {}", other)
        )),
    }
}

pub fn initialize_store(args: &Args) -> Result<Arc<dyn DurableStore>> {
    info!("Durable store backend: {} at {}", args.store_type, args.store_host);
    create_store(args)
}
