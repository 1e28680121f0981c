use log::{ debug, info, warn };
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::cache::keys::KeySpace;
use crate::cache::local::LocalCache;
use crate::cache::writer::CacheWriterPool;
use crate::cache::DistributedCache;
use crate::hierarchy::HierarchyIndex;
use crate::models::SubChatPointer;
use crate::store::{ DurableStore, CONVERSATIONS, MESSAGES };

const MESSAGE_DELETE_RETRIES: u32 = 3;
const RECORD_DELETE_RETRIES: u32 = 5;
const RETRY_BASE_DELAY_MS: u64 = 100;
const MESSAGE_BATCH_LIMIT: usize = 1000;

/// Per-conversation deletion progress. `PartialFailure` is terminal but still
/// reported to the caller as success: retrying a stuck delete forever is worse
/// than leaving cache debris that TTLs reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeletionState {
    Init,
    ChildrenResolved,
    MessagesDeleted,
    CachesPurged,
    RecordDeleted,
    Verified,
    Done,
    PartialFailure,
}

/// Drives cascading deletion across all three tiers. Descendants are removed
/// before their ancestors via an explicit worklist, so no sub-chat ever
/// survives its main chat and no recursion depth is at stake.
pub struct DeletionCoordinator {
    local: Arc<LocalCache>,
    cache: Arc<dyn DistributedCache>,
    store: Arc<dyn DurableStore>,
    hierarchy: Arc<HierarchyIndex>,
    keys: KeySpace,
    writers: Arc<CacheWriterPool>,
}

impl DeletionCoordinator {
    pub fn new(
        local: Arc<LocalCache>,
        cache: Arc<dyn DistributedCache>,
        store: Arc<dyn DurableStore>,
        hierarchy: Arc<HierarchyIndex>,
        keys: KeySpace,
        writers: Arc<CacheWriterPool>
    ) -> Self {
        Self { local, cache, store, hierarchy, keys, writers }
    }

    /// Deletes a conversation and everything below it, applying queued
    /// background cache writes first so the purge cannot be undone by one of
    /// them. Always returns `true`: unreachable tiers degrade to best-effort
    /// cleanup, and an id that never existed still gets its cache keys
    /// cleared before reporting success.
    pub async fn delete(&self, conversation_id: &str) -> bool {
        self.writers.drain().await;

        let owner = match self.hierarchy.load_conversation(conversation_id).await {
            Ok(Some(conversation)) => Some(conversation.owner),
            Ok(None) => None,
            Err(e) => {
                warn!("Deleting {} without metadata: {}", conversation_id, e);
                None
            }
        };

        if !self.store.health_check().await {
            warn!(
                "Durable store unreachable; cache-only purge for {}, record removal deferred",
                conversation_id
            );
            self.degraded_purge(conversation_id, owner.as_deref()).await;
            return true;
        }

        let tree_main = match self.hierarchy.resolve_main_chat(conversation_id).await {
            Ok(main_id) => main_id,
            Err(e) => {
                warn!("Treating {} as its own main chat: {}", conversation_id, e);
                conversation_id.to_string()
            }
        };
        let descendants = match self.hierarchy.list_descendants(conversation_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Deleting {} without its descendant set: {}", conversation_id, e);
                Vec::new()
            }
        };

        // The descendant walk yields parents before children; deleting in
        // reverse removes leaves first, the target last.
        let mut order = descendants;
        order.reverse();
        order.push(conversation_id.to_string());

        let total = order.len();
        let mut residual = 0usize;
        for node in &order {
            let state = self.delete_node(node, &tree_main, owner.as_deref()).await;
            if state != DeletionState::Done {
                residual += 1;
            }
        }
        if residual > 0 {
            warn!(
                "Deleted {} ({} records, {} with residue); TTL expiry reclaims the rest",
                conversation_id, total, residual
            );
        } else {
            info!("Deleted {} ({} records)", conversation_id, total);
        }
        true
    }

    /// One conversation through the full state machine.
    async fn delete_node(
        &self,
        conversation_id: &str,
        tree_main: &str,
        owner: Option<&str>
    ) -> DeletionState {
        let mut clean = true;
        let mut state = DeletionState::Init;
        loop {
            state = match state {
                DeletionState::Init => DeletionState::ChildrenResolved,
                DeletionState::ChildrenResolved => {
                    if !self.delete_messages(conversation_id).await {
                        clean = false;
                    }
                    DeletionState::MessagesDeleted
                }
                DeletionState::MessagesDeleted => {
                    self.purge_caches(conversation_id, owner).await;
                    if conversation_id != tree_main {
                        self.hierarchy.remove_edge(tree_main, conversation_id).await;
                    }
                    DeletionState::CachesPurged
                }
                DeletionState::CachesPurged => {
                    if !self.delete_record(conversation_id).await {
                        clean = false;
                    }
                    DeletionState::RecordDeleted
                }
                DeletionState::RecordDeleted => {
                    if !self.verify_record_absent(conversation_id).await {
                        clean = false;
                    }
                    DeletionState::Verified
                }
                DeletionState::Verified => {
                    if clean {
                        DeletionState::Done
                    } else {
                        DeletionState::PartialFailure
                    }
                }
                DeletionState::Done | DeletionState::PartialFailure => {
                    break;
                }
            };
        }
        state
    }

    /// Deletes every stored message of a conversation, up to three attempts
    /// per message. Returns false if anything was left behind.
    async fn delete_messages(&self, conversation_id: &str) -> bool {
        let mut clean = true;
        loop {
            let batch = match
                self.store
                    .query(MESSAGES, &[("conversation_id", conversation_id)], MESSAGE_BATCH_LIMIT).await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Cannot enumerate messages of {}: {}", conversation_id, e);
                    return false;
                }
            };
            if batch.is_empty() {
                return clean;
            }

            let mut progressed = false;
            for row in &batch {
                let Some(message_id) = row.get("id").and_then(|v| v.as_str()) else {
                    clean = false;
                    continue;
                };
                let mut deleted = false;
                for attempt in 1..=MESSAGE_DELETE_RETRIES {
                    match self.store.delete(MESSAGES, message_id).await {
                        Ok(_) => {
                            deleted = true;
                            break;
                        }
                        Err(e) => {
                            warn!(
                                "Delete of message {} failed (attempt {}/{}): {}",
                                message_id, attempt, MESSAGE_DELETE_RETRIES, e
                            );
                        }
                    }
                }
                if deleted {
                    progressed = true;
                } else {
                    clean = false;
                }
            }
            if !progressed {
                // Nothing in this batch went away; a re-query would spin.
                return false;
            }
        }
    }

    /// Purges all cache tiers for one conversation: the local map, every key
    /// the reverse index recorded, the directly derivable keys, and a
    /// prefix-bounded scan for keys still carrying the raw id or owner from
    /// older key derivations.
    async fn purge_caches(&self, conversation_id: &str, owner: Option<&str>) {
        self.local.remove(conversation_id);

        let reverse_key = self.keys.reverse_index(conversation_id);
        let mut targets: HashSet<String> = self.cache
            .list_range(&reverse_key, 0, -1).await
            .into_iter()
            .collect();
        targets.insert(self.keys.metadata(conversation_id));
        targets.insert(self.keys.messages(conversation_id));
        targets.insert(self.keys.hierarchy_main(conversation_id));
        targets.insert(self.keys.hierarchy_sub(conversation_id));
        targets.insert(self.keys.tree_context(conversation_id));
        targets.insert(reverse_key);
        if let Some(owner) = owner {
            targets.insert(self.keys.user_conversations(owner, true));
            targets.insert(self.keys.user_conversations(owner, false));
        }

        let targets: Vec<String> = targets.into_iter().collect();
        let removed = self.cache.delete(&targets).await;
        debug!("Purged {} cache keys for {}", removed, conversation_id);

        let mut swept = self.cache.delete_matching(&self.keys.scan_pattern(conversation_id)).await;
        if let Some(owner) = owner {
            swept += self.cache.delete_matching(&self.keys.scan_pattern(owner)).await;
        }
        if swept > 0 {
            info!("Swept {} drifted cache keys for {}", swept, conversation_id);
        }
    }

    async fn delete_record(&self, conversation_id: &str) -> bool {
        for attempt in 0..RECORD_DELETE_RETRIES {
            match self.store.delete(CONVERSATIONS, conversation_id).await {
                Ok(_) => {
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Delete of record {} failed (attempt {}/{}): {}",
                        conversation_id, attempt + 1, RECORD_DELETE_RETRIES, e
                    );
                    if attempt + 1 < RECORD_DELETE_RETRIES {
                        sleep(Duration::from_millis(RETRY_BASE_DELAY_MS << attempt)).await;
                    }
                }
            }
        }
        false
    }

    /// Re-reads the record after deletion; if it is somehow still there, makes
    /// one last attempt. Residue is logged, never surfaced.
    async fn verify_record_absent(&self, conversation_id: &str) -> bool {
        match self.store.get(CONVERSATIONS, conversation_id).await {
            Ok(None) => true,
            Ok(Some(_)) => {
                warn!("Record {} survived deletion; retrying once", conversation_id);
                let _ = self.store.delete(CONVERSATIONS, conversation_id).await;
                match self.store.get(CONVERSATIONS, conversation_id).await {
                    Ok(None) => true,
                    Ok(Some(_)) => {
                        warn!("Record {} still present after final attempt", conversation_id);
                        false
                    }
                    Err(e) => {
                        warn!("Cannot verify deletion of {}: {}", conversation_id, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Cannot verify deletion of {}: {}", conversation_id, e);
                false
            }
        }
    }

    /// Store-down path: purge whatever the caches alone can tell us about.
    /// Future reads re-check the durable store once it is reachable again.
    async fn degraded_purge(&self, conversation_id: &str, owner: Option<&str>) {
        let cached_descendants = match
            self.cache.get(&self.keys.hierarchy_main(conversation_id)).await
        {
            Some(raw) => serde_json::from_str::<Vec<String>>(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        for descendant in &cached_descendants {
            self.purge_caches(descendant, owner).await;
        }

        // Detach from a surviving tree if the back-pointer is still cached.
        if let Some(raw) = self.cache.get(&self.keys.hierarchy_sub(conversation_id)).await {
            if let Ok(pointer) = serde_json::from_str::<SubChatPointer>(&raw) {
                self.hierarchy.remove_edge(&pointer.main_chat_id, conversation_id).await;
            }
        }
        self.purge_caches(conversation_id, owner).await;
    }
}
