use log::{ debug, warn };
use std::collections::{ HashSet, VecDeque };
use std::sync::Arc;

use crate::cache::keys::KeySpace;
use crate::cache::{ CacheOp, DistributedCache };
use crate::error::{ ChatStoreError, Result };
use crate::models::{ Conversation, SubChatPointer };
use crate::store::{ DurableStore, CONVERSATIONS };

/// Parent-walk bound. Trees this deep do not occur in practice; hitting the
/// bound means a corrupted parent chain, which must surface rather than be
/// silently truncated.
const MAX_PARENT_HOPS: u32 = 64;

const CHILD_QUERY_LIMIT: usize = 1000;

/// Maintains main-chat to descendant relationships in the distributed cache,
/// with the durable store as the recovery source. Edge writes refresh TTLs to
/// the metadata horizon; edges vanish on their own if never touched again.
pub struct HierarchyIndex {
    cache: Arc<dyn DistributedCache>,
    store: Arc<dyn DurableStore>,
    keys: KeySpace,
    metadata_ttl: u64,
}

impl HierarchyIndex {
    pub fn new(
        cache: Arc<dyn DistributedCache>,
        store: Arc<dyn DurableStore>,
        keys: KeySpace,
        metadata_ttl: u64
    ) -> Self {
        Self { cache, store, keys, metadata_ttl }
    }

    /// Walks parent links up to the root. A conversation with no parent (or
    /// one that no longer resolves) is its own main chat.
    pub async fn resolve_main_chat(&self, conversation_id: &str) -> Result<String> {
        // Warm path: the back-pointer collapses the walk to one read.
        if let Some(raw) = self.cache.get(&self.keys.hierarchy_sub(conversation_id)).await {
            match serde_json::from_str::<SubChatPointer>(&raw) {
                Ok(pointer) => {
                    return Ok(pointer.main_chat_id);
                }
                Err(e) => warn!("Discarding malformed hierarchy pointer for {}: {}", conversation_id, e),
            }
        }

        let mut current = match self.load_conversation(conversation_id).await? {
            Some(conversation) => conversation,
            None => {
                return Ok(conversation_id.to_string());
            }
        };

        let mut hops: u32 = 0;
        while let Some(parent_id) = current.parent_id.clone() {
            if hops >= MAX_PARENT_HOPS {
                return Err(ChatStoreError::CycleOrExcessiveDepth {
                    start: conversation_id.to_string(),
                    hops: MAX_PARENT_HOPS,
                });
            }
            match self.load_conversation(&parent_id).await? {
                Some(parent) => {
                    current = parent;
                }
                None => break,
            }
            hops += 1;
        }

        Ok(current.id)
    }

    /// Records `descendant_id` under its main chat and writes the descendant's
    /// back-pointer. Idempotent: re-registering an existing edge only
    /// refreshes TTLs.
    pub async fn register_edge(&self, main_id: &str, descendant_id: &str, owner: &str) -> Result<()> {
        if main_id == descendant_id {
            return Err(ChatStoreError::Validation(
                format!("conversation '{}' cannot descend from itself", main_id)
            ));
        }

        let main_key = self.keys.hierarchy_main(main_id);
        let sub_key = self.keys.hierarchy_sub(descendant_id);

        let mut descendants = self.read_descendant_set(&main_key).await;
        if descendants.iter().any(|id| id == descendant_id) {
            self.cache.pipeline(vec![
                CacheOp::Expire { key: main_key, ttl: self.metadata_ttl },
                CacheOp::Expire { key: sub_key, ttl: self.metadata_ttl }
            ]).await;
            return Ok(());
        }

        descendants.push(descendant_id.to_string());
        let pointer = SubChatPointer {
            main_chat_id: main_id.to_string(),
            owner: owner.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        let ops = vec![
            CacheOp::Set {
                key: main_key.clone(),
                value: serde_json::to_string(&descendants)?,
                ttl: Some(self.metadata_ttl),
            },
            CacheOp::Set {
                key: sub_key.clone(),
                value: serde_json::to_string(&pointer)?,
                ttl: Some(self.metadata_ttl),
            },
            CacheOp::ListPush { key: self.keys.reverse_index(main_id), value: main_key },
            CacheOp::Expire { key: self.keys.reverse_index(main_id), ttl: self.metadata_ttl },
            CacheOp::ListPush { key: self.keys.reverse_index(descendant_id), value: sub_key },
            CacheOp::Expire { key: self.keys.reverse_index(descendant_id), ttl: self.metadata_ttl }
        ];
        let results = self.cache.pipeline(ops).await;
        if results.iter().any(|ok| !ok) {
            debug!("Hierarchy edge {} -> {} not fully cached", main_id, descendant_id);
        }
        Ok(())
    }

    /// Transitive descendant ids of a main chat. Cache-first; a miss walks the
    /// durable store by parent link and repopulates the cache.
    pub async fn list_descendants(&self, main_id: &str) -> Result<Vec<String>> {
        let main_key = self.keys.hierarchy_main(main_id);
        if let Some(raw) = self.cache.get(&main_key).await {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => {
                    return Ok(ids);
                }
                Err(e) => warn!("Discarding malformed descendant set for {}: {}", main_id, e),
            }
        }

        let mut found: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(main_id.to_string());
        let mut worklist: VecDeque<String> = VecDeque::new();
        worklist.push_back(main_id.to_string());

        while let Some(current) = worklist.pop_front() {
            let children = self.store
                .query(CONVERSATIONS, &[("parent_id", current.as_str())], CHILD_QUERY_LIMIT).await?;
            for child in children {
                if let Some(id) = child.get("id").and_then(|v| v.as_str()) {
                    if seen.insert(id.to_string()) {
                        found.push(id.to_string());
                        worklist.push_back(id.to_string());
                    }
                }
            }
        }

        if found.is_empty() {
            // Never persist an empty descendant set.
            self.cache.delete(std::slice::from_ref(&main_key)).await;
        } else {
            let ops = vec![
                CacheOp::Set {
                    key: main_key.clone(),
                    value: serde_json::to_string(&found)?,
                    ttl: Some(self.metadata_ttl),
                },
                CacheOp::ListPush { key: self.keys.reverse_index(main_id), value: main_key },
                CacheOp::Expire { key: self.keys.reverse_index(main_id), ttl: self.metadata_ttl }
            ];
            self.cache.pipeline(ops).await;
        }
        Ok(found)
    }

    /// Drops one descendant from its main chat's edge set and removes the
    /// back-pointer. Removing the last descendant deletes the edge-set key.
    pub async fn remove_edge(&self, main_id: &str, descendant_id: &str) {
        let main_key = self.keys.hierarchy_main(main_id);
        let sub_key = self.keys.hierarchy_sub(descendant_id);

        let mut descendants = self.read_descendant_set(&main_key).await;
        let before = descendants.len();
        descendants.retain(|id| id != descendant_id);

        if descendants.is_empty() {
            self.cache.delete(&[main_key, sub_key]).await;
            return;
        }
        if descendants.len() != before {
            match serde_json::to_string(&descendants) {
                Ok(encoded) => {
                    self.cache.set(&main_key, &encoded, Some(self.metadata_ttl)).await;
                }
                Err(e) => warn!("Failed to encode descendant set for {}: {}", main_id, e),
            }
        }
        self.cache.delete(std::slice::from_ref(&sub_key)).await;
    }

    async fn read_descendant_set(&self, main_key: &str) -> Vec<String> {
        match self.cache.get(main_key).await {
            Some(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Resetting malformed descendant set: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    /// Metadata read-through: distributed cache first, then the durable
    /// store. Does not repopulate; that is the service facade's job.
    pub(crate) async fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        if let Some(raw) = self.cache.get(&self.keys.metadata(conversation_id)).await {
            match serde_json::from_str::<Conversation>(&raw) {
                Ok(conversation) => {
                    return Ok(Some(conversation));
                }
                Err(e) => warn!("Discarding malformed cached metadata for {}: {}", conversation_id, e),
            }
        }
        match self.store.get(CONVERSATIONS, conversation_id).await? {
            Some(props) => {
                let conversation = serde_json::from_value(serde_json::Value::Object(props))?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::store::memory::MemoryObjectStore;
    use crate::store::Props;

    fn conversation(id: &str, parent: Option<&str>) -> Conversation {
        Conversation {
            id: id.to_string(),
            owner: "u1".to_string(),
            title: "t".to_string(),
            parent_id: parent.map(|p| p.to_string()),
            created_at: 1,
            updated_at: 1,
            inherit_context: false,
            depth: if parent.is_some() { 1 } else { 0 },
        }
    }

    fn props_of(conversation: &Conversation) -> Props {
        match serde_json::to_value(conversation) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Props::new(),
        }
    }

    async fn seed(store: &MemoryObjectStore, conversation: &Conversation) {
        store
            .create_with_id(CONVERSATIONS, &conversation.id, props_of(conversation)).await
            .expect("seed conversation");
    }

    fn index(cache: &Arc<MemoryCache>, store: &Arc<MemoryObjectStore>) -> HierarchyIndex {
        HierarchyIndex::new(
            cache.clone() as Arc<dyn DistributedCache>,
            store.clone() as Arc<dyn DurableStore>,
            KeySpace::new("chat"),
            3600
        )
    }

    #[tokio::test]
    async fn resolve_walks_parent_chain_from_store() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryObjectStore::new());
        seed(&store, &conversation("main", None)).await;
        seed(&store, &conversation("child", Some("main"))).await;
        seed(&store, &conversation("grandchild", Some("child"))).await;

        let index = index(&cache, &store);
        assert_eq!(index.resolve_main_chat("grandchild").await.expect("resolve"), "main");
        assert_eq!(index.resolve_main_chat("child").await.expect("resolve"), "main");
        assert_eq!(index.resolve_main_chat("main").await.expect("resolve"), "main");
        // Unknown ids resolve to themselves, matching delete-idempotence needs.
        assert_eq!(index.resolve_main_chat("ghost").await.expect("resolve"), "ghost");
    }

    #[tokio::test]
    async fn resolve_uses_back_pointer_before_walking() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryObjectStore::new());
        let index = index(&cache, &store);

        index.register_edge("main", "sub", "u1").await.expect("register");
        // No conversation records exist; only the back-pointer can answer.
        assert_eq!(index.resolve_main_chat("sub").await.expect("resolve"), "main");
    }

    #[tokio::test]
    async fn corrupted_parent_cycle_is_reported() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryObjectStore::new());
        seed(&store, &conversation("a", Some("b"))).await;
        seed(&store, &conversation("b", Some("a"))).await;

        let index = index(&cache, &store);
        assert!(matches!(
            index.resolve_main_chat("a").await,
            Err(ChatStoreError::CycleOrExcessiveDepth { .. })
        ));
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryObjectStore::new());
        let index = index(&cache, &store);

        index.register_edge("main", "sub", "u1").await.expect("register");
        index.register_edge("main", "sub", "u1").await.expect("register again");
        assert_eq!(index.list_descendants("main").await.expect("list"), vec!["sub"]);
    }

    #[tokio::test]
    async fn listing_repopulates_from_store_transitively() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryObjectStore::new());
        seed(&store, &conversation("main", None)).await;
        seed(&store, &conversation("child", Some("main"))).await;
        seed(&store, &conversation("grandchild", Some("child"))).await;

        let index = index(&cache, &store);
        let mut ids = index.list_descendants("main").await.expect("list");
        ids.sort();
        assert_eq!(ids, vec!["child", "grandchild"]);

        // Second call is served from the cache even with the store offline.
        store.set_available(false);
        let mut cached = index.list_descendants("main").await.expect("cached list");
        cached.sort();
        assert_eq!(cached, vec!["child", "grandchild"]);
    }

    #[tokio::test]
    async fn removing_last_edge_deletes_the_set_key() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryObjectStore::new());
        let index = index(&cache, &store);

        index.register_edge("main", "s1", "u1").await.expect("register");
        index.register_edge("main", "s2", "u1").await.expect("register");
        index.remove_edge("main", "s1").await;
        assert_eq!(index.list_descendants("main").await.expect("list"), vec!["s2"]);

        index.remove_edge("main", "s2").await;
        let keys = KeySpace::new("chat");
        assert!(cache.get(&keys.hierarchy_main("main")).await.is_none());
        assert!(cache.get(&keys.hierarchy_sub("s2")).await.is_none());
    }
}
