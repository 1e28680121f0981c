use chrono::Utc;
use log::{ debug, info, warn };
use std::sync::atomic::{ AtomicI64, Ordering };
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::keys::KeySpace;
use crate::cache::local::LocalCache;
use crate::cache::writer::CacheWriterPool;
use crate::cache::{ initialize_cache, CacheOp, DistributedCache };
use crate::config::Args;
use crate::context::ContextAssembler;
use crate::deletion::DeletionCoordinator;
use crate::error::{ ChatStoreError, Result };
use crate::hierarchy::HierarchyIndex;
use crate::models::{ ChatMessage, Conversation, ContextEntry, HierarchyStats, ShareToken };
use crate::store::{ initialize_store, DurableStore, Props, CONVERSATIONS, MESSAGES };

const DEFAULT_TITLE: &str = "New Conversation";

/// The conversation storage service. Owns all three tiers by explicit handle
/// and exposes the request-facing operations; no globals, so independent
/// instances never share state.
pub struct ChatStore {
    args: Args,
    keys: KeySpace,
    local: Arc<LocalCache>,
    cache: Arc<dyn DistributedCache>,
    store: Arc<dyn DurableStore>,
    hierarchy: Arc<HierarchyIndex>,
    assembler: ContextAssembler,
    deletion: DeletionCoordinator,
    // Post-response cache writes, sharded by conversation or owner so
    // per-key order is preserved while workers run independently.
    writers: Arc<CacheWriterPool>,
    // High-water mark for issued timestamps, so bursts within one
    // millisecond still get strictly increasing values.
    clock: AtomicI64,
}

impl ChatStore {
    /// Builds the service from configuration, constructing the configured
    /// cache and store backends. Must run inside a Tokio runtime, which the
    /// background writers are spawned onto.
    pub fn new(args: &Args) -> Result<Self> {
        let cache = initialize_cache(args)?;
        let store = initialize_store(args)?;
        Ok(Self::with_backends(args.clone(), cache, store))
    }

    /// Builds the service around caller-supplied backends.
    pub fn with_backends(
        args: Args,
        cache: Arc<dyn DistributedCache>,
        store: Arc<dyn DurableStore>
    ) -> Self {
        let keys = KeySpace::new(&args.cache_key_prefix);
        let local = Arc::new(LocalCache::new(args.local_cache_capacity));
        let hierarchy = Arc::new(
            HierarchyIndex::new(cache.clone(), store.clone(), keys.clone(), args.metadata_ttl_secs)
        );
        let assembler = ContextAssembler::new(
            cache.clone(),
            store.clone(),
            hierarchy.clone(),
            keys.clone(),
            args.max_messages_per_conversation
        );
        let writers = Arc::new(
            CacheWriterPool::new(args.cache_writer_workers, args.cache_writer_queue_depth, cache.clone())
        );
        let deletion = DeletionCoordinator::new(
            local.clone(),
            cache.clone(),
            store.clone(),
            hierarchy.clone(),
            keys.clone(),
            writers.clone()
        );
        info!(
            "Chat store ready: {} cache writers, local capacity {}",
            writers.worker_count(), args.local_cache_capacity
        );
        Self {
            args,
            keys,
            local,
            cache,
            store,
            hierarchy,
            assembler,
            deletion,
            writers,
            clock: AtomicI64::new(0),
        }
    }

    /// Creates a conversation. With a parent id the new conversation becomes
    /// a sub-chat: its depth is parent depth + 1 and it is registered under
    /// the tree's main chat before this returns.
    pub async fn create_conversation(
        &self,
        owner: &str,
        title: &str,
        parent_id: Option<&str>,
        inherit_context: bool
    ) -> Result<Conversation> {
        if owner.trim().is_empty() {
            return Err(ChatStoreError::Validation("owner must not be empty".to_string()));
        }
        let title = if title.trim().is_empty() { DEFAULT_TITLE } else { title };

        let parent = match parent_id {
            Some(pid) => {
                let parent = self.get_conversation(pid).await?
                    .ok_or_else(|| ChatStoreError::NotFound(pid.to_string()))?;
                Some(parent)
            }
            None => None,
        };

        let now = self.next_timestamp();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            title: title.to_string(),
            parent_id: parent.as_ref().map(|p| p.id.clone()),
            created_at: now,
            updated_at: now,
            inherit_context,
            depth: parent.as_ref().map_or(0, |p| p.depth + 1),
        };

        let created = self.store
            .create_with_id(CONVERSATIONS, &conversation.id, props_for(&conversation)?).await?;
        if !created {
            return Err(ChatStoreError::Validation(
                format!("store rejected conversation id '{}'", conversation.id)
            ));
        }

        if let Some(parent) = &parent {
            let main_id = self.hierarchy.resolve_main_chat(&parent.id).await?;
            self.hierarchy.register_edge(&main_id, &conversation.id, owner).await?;
        }

        self.local.put(conversation.clone());
        let mut ops = vec![CacheOp::Set {
            key: self.keys.metadata(&conversation.id),
            value: serde_json::to_string(&conversation)?,
            ttl: Some(self.args.metadata_ttl_secs),
        }];
        ops.extend(self.listing_invalidation(owner));
        self.writers.enqueue(&conversation.id, "metadata", ops);

        debug!("Created conversation {} (depth {})", conversation.id, conversation.depth);
        Ok(conversation)
    }

    /// Reads through the tiers: local map, then distributed cache, then the
    /// durable store, repopulating the faster tiers on the way back.
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        if let Some(conversation) = self.local.get(conversation_id) {
            return Ok(Some(conversation));
        }

        if let Some(raw) = self.cache.get(&self.keys.metadata(conversation_id)).await {
            match serde_json::from_str::<Conversation>(&raw) {
                Ok(conversation) => {
                    self.local.put(conversation.clone());
                    return Ok(Some(conversation));
                }
                Err(e) => warn!("Discarding malformed cached metadata for {}: {}", conversation_id, e),
            }
        }

        match self.store.get(CONVERSATIONS, conversation_id).await? {
            Some(props) => {
                let conversation: Conversation =
                    serde_json::from_value(serde_json::Value::Object(props))?;
                self.local.put(conversation.clone());
                let ops = vec![CacheOp::Set {
                    key: self.keys.metadata(conversation_id),
                    value: serde_json::to_string(&conversation)?,
                    ttl: Some(self.args.metadata_ttl_secs),
                }];
                self.writers.enqueue(conversation_id, "metadata", ops);
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    /// A user's conversations, most recently updated first. Served from a
    /// short-lived cached listing when available; `include_sub_chats = false`
    /// restricts the result to main chats.
    pub async fn list_user_conversations(
        &self,
        owner: &str,
        limit: usize,
        include_sub_chats: bool
    ) -> Result<Vec<Conversation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let listing_key = self.keys.user_conversations(owner, include_sub_chats);
        if let Some(raw) = self.cache.get(&listing_key).await {
            match serde_json::from_str::<Vec<Conversation>>(&raw) {
                Ok(mut conversations) => {
                    conversations.truncate(limit);
                    return Ok(conversations);
                }
                Err(e) => warn!("Discarding malformed cached listing for {}: {}", owner, e),
            }
        }

        let rows = self.store.query(CONVERSATIONS, &[("owner", owner)], 1000).await?;
        let mut conversations: Vec<Conversation> = rows
            .into_iter()
            .filter_map(|props| {
                match serde_json::from_value::<Conversation>(serde_json::Value::Object(props)) {
                    Ok(conversation) => Some(conversation),
                    Err(e) => {
                        warn!("Skipping malformed conversation record for {}: {}", owner, e);
                        None
                    }
                }
            })
            .collect();
        if !include_sub_chats {
            conversations.retain(|conversation| conversation.parent_id.is_none());
        }
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        // Cached whole, trimmed per call: the first caller's limit must not
        // stick to everyone served from the listing after it.
        if !conversations.is_empty() {
            let ops = vec![CacheOp::Set {
                key: listing_key,
                value: serde_json::to_string(&conversations)?,
                ttl: Some(self.args.user_cache_ttl_secs),
            }];
            self.writers.enqueue(owner, "listing", ops);
        }
        conversations.truncate(limit);
        Ok(conversations)
    }

    /// Appends a message: the durable write happens before this returns, the
    /// cached message list is pushed, trimmed and re-expired in the
    /// background. Timestamps are strictly increasing per service instance.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str
    ) -> Result<ChatMessage> {
        if role.trim().is_empty() {
            return Err(ChatStoreError::Validation("message role must not be empty".to_string()));
        }
        let mut conversation = self.get_conversation(conversation_id).await?
            .ok_or_else(|| ChatStoreError::NotFound(conversation_id.to_string()))?;

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp: self.next_timestamp(),
        };
        let created = self.store
            .create_with_id(MESSAGES, &message.id, props_for(&message)?).await?;
        if !created {
            return Err(ChatStoreError::Validation(
                format!("store rejected message id '{}'", message.id)
            ));
        }

        conversation.updated_at = message.timestamp;
        let mut patch = Props::new();
        patch.insert("updated_at".to_string(), serde_json::json!(message.timestamp));
        if let Err(e) = self.store.update(CONVERSATIONS, conversation_id, patch).await {
            warn!("Could not touch {} after append: {}", conversation_id, e);
        }
        self.local.put(conversation.clone());

        let messages_key = self.keys.messages(conversation_id);
        let keep = self.args.max_messages_per_conversation.max(1) as isize;
        let encoded = serde_json::to_string(&message)?;
        let ops = vec![
            CacheOp::ListPush { key: messages_key.clone(), value: encoded.clone() },
            CacheOp::ListTrim { key: messages_key.clone(), start: 0, stop: keep - 1 },
            CacheOp::Expire { key: messages_key, ttl: self.args.message_ttl_secs },
            CacheOp::Set {
                key: self.keys.metadata(conversation_id),
                value: serde_json::to_string(&conversation)?,
                ttl: Some(self.args.metadata_ttl_secs),
            }
        ];
        self.writers.enqueue(conversation_id, "messages", ops);

        // The tree-wide activity list lives under the main chat, so shard by
        // that id: appends from sibling sub-chats then share one writer.
        match self.hierarchy.resolve_main_chat(conversation_id).await {
            Ok(main_chat_id) => {
                let tree_key = self.keys.tree_context(&main_chat_id);
                let depth = self.args.tree_context_depth.max(1) as isize;
                let ops = vec![
                    CacheOp::ListPush { key: tree_key.clone(), value: encoded },
                    CacheOp::ListTrim { key: tree_key.clone(), start: 0, stop: depth - 1 },
                    CacheOp::Expire { key: tree_key, ttl: self.args.message_ttl_secs }
                ];
                self.writers.enqueue(&main_chat_id, "tree-context", ops);
            }
            Err(e) => warn!("Skipping tree activity update for {}: {}", conversation_id, e),
        }
        Ok(message)
    }

    /// Model-ready context for a conversation; see `ContextAssembler`.
    pub async fn get_context(
        &self,
        conversation_id: &str,
        limit: usize,
        include_all_descendants: bool
    ) -> Result<Vec<ContextEntry>> {
        self.assembler.assemble(conversation_id, limit, include_all_descendants).await
    }

    /// Cascading delete across all tiers. Always returns `true`; unreachable
    /// tiers degrade to best-effort cleanup with TTL hygiene.
    pub async fn delete_conversation(&self, conversation_id: &str) -> bool {
        self.deletion.delete(conversation_id).await
    }

    /// Tree-level overview for one conversation: its main chat, the
    /// descendant set and the message volume across the whole tree.
    pub async fn hierarchy_stats(&self, conversation_id: &str) -> Result<HierarchyStats> {
        let main_chat_id = self.hierarchy.resolve_main_chat(conversation_id).await?;
        let sub_chat_ids = self.hierarchy.list_descendants(&main_chat_id).await?;

        let mut total_messages_in_tree = 0usize;
        total_messages_in_tree += self.count_messages(&main_chat_id).await?;
        for sub_chat_id in &sub_chat_ids {
            total_messages_in_tree += self.count_messages(sub_chat_id).await?;
        }

        Ok(HierarchyStats {
            conversation_id: conversation_id.to_string(),
            main_chat_id: main_chat_id.clone(),
            is_main_chat: conversation_id == main_chat_id,
            total_sub_chats: sub_chat_ids.len(),
            sub_chat_ids,
            total_messages_in_tree,
        })
    }

    /// Most recent messages across a conversation's whole tree, oldest first.
    /// Served from the rolling activity list kept at append time; a cold list
    /// falls back to merging every tree member's messages.
    pub async fn recent_tree_messages(
        &self,
        conversation_id: &str,
        limit: usize
    ) -> Result<Vec<ChatMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let main_chat_id = self.hierarchy.resolve_main_chat(conversation_id).await?;
        let cached = self.cache
            .list_range(&self.keys.tree_context(&main_chat_id), 0, (limit as isize) - 1).await;
        if !cached.is_empty() {
            let mut messages: Vec<ChatMessage> = cached
                .iter()
                .filter_map(|raw| match serde_json::from_str::<ChatMessage>(raw) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Skipping malformed activity entry under {}: {}", main_chat_id, e);
                        None
                    }
                })
                .collect();
            messages.reverse();
            return Ok(messages);
        }

        let mut members = vec![main_chat_id.clone()];
        members.extend(self.hierarchy.list_descendants(&main_chat_id).await?);
        let mut messages: Vec<ChatMessage> = Vec::new();
        for member in &members {
            messages.extend(self.assembler.load_messages(member).await?);
        }
        messages.sort_by_key(|message| message.timestamp);
        if messages.len() > limit {
            messages = messages.split_off(messages.len() - limit);
        }
        Ok(messages)
    }

    /// Retitles a conversation. Returns `false` when the id does not exist.
    pub async fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<bool> {
        if title.trim().is_empty() {
            return Err(ChatStoreError::Validation("title must not be empty".to_string()));
        }
        let mut conversation = match self.get_conversation(conversation_id).await? {
            Some(conversation) => conversation,
            None => {
                return Ok(false);
            }
        };

        conversation.title = title.to_string();
        conversation.updated_at = self.next_timestamp();
        let mut patch = Props::new();
        patch.insert("title".to_string(), serde_json::json!(title));
        patch.insert("updated_at".to_string(), serde_json::json!(conversation.updated_at));
        if !self.store.update(CONVERSATIONS, conversation_id, patch).await? {
            return Ok(false);
        }

        self.local.put(conversation.clone());
        let mut ops = vec![CacheOp::Set {
            key: self.keys.metadata(conversation_id),
            value: serde_json::to_string(&conversation)?,
            ttl: Some(self.args.metadata_ttl_secs),
        }];
        ops.extend(self.listing_invalidation(&conversation.owner));
        self.writers.enqueue(conversation_id, "metadata", ops);
        Ok(true)
    }

    /// Issues a shareable token for a conversation, stored only in the
    /// distributed cache with its own TTL. Fails when the cache cannot hold
    /// it, since an unstorable token would never resolve.
    pub async fn create_share_token(&self, conversation_id: &str) -> Result<ShareToken> {
        let conversation = self.get_conversation(conversation_id).await?
            .ok_or_else(|| ChatStoreError::NotFound(conversation_id.to_string()))?;

        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let share = ShareToken {
            token,
            conversation_id: conversation.id.clone(),
            expires_at: Utc::now().timestamp_millis()
                + (self.args.share_token_ttl_secs as i64) * 1000,
        };
        let share_key = self.keys.share_token(&share.token);
        let stored = self.cache
            .set(&share_key, &serde_json::to_string(&share)?, Some(self.args.share_token_ttl_secs)).await;
        if !stored {
            return Err(ChatStoreError::CacheUnavailable(
                "share token could not be stored".to_string()
            ));
        }

        let reverse_key = self.keys.reverse_index(&conversation.id);
        let ops = vec![
            CacheOp::ListPush { key: reverse_key.clone(), value: share_key },
            CacheOp::Expire { key: reverse_key, ttl: self.args.metadata_ttl_secs }
        ];
        self.writers.enqueue(&conversation.id, "share-index", ops);
        Ok(share)
    }

    /// Resolves a share token to its conversation, if the token is still
    /// live and the conversation still exists.
    pub async fn resolve_share_token(&self, token: &str) -> Result<Option<Conversation>> {
        let raw = match self.cache.get(&self.keys.share_token(token)).await {
            Some(raw) => raw,
            None => {
                return Ok(None);
            }
        };
        let share = match serde_json::from_str::<ShareToken>(&raw) {
            Ok(share) => share,
            Err(e) => {
                warn!("Discarding malformed share token: {}", e);
                return Ok(None);
            }
        };
        if share.expires_at <= Utc::now().timestamp_millis() {
            return Ok(None);
        }
        self.get_conversation(&share.conversation_id).await
    }

    /// Invalidates a share token. Returns whether the token existed.
    pub async fn revoke_share_token(&self, token: &str) -> bool {
        self.cache.delete(&[self.keys.share_token(token)]).await > 0
    }

    /// Distributed cache reachability.
    pub async fn cache_healthy(&self) -> bool {
        self.cache.health_check().await
    }

    /// Durable store reachability.
    pub async fn store_healthy(&self) -> bool {
        self.store.health_check().await
    }

    async fn count_messages(&self, conversation_id: &str) -> Result<usize> {
        let cached = self.cache
            .list_range(&self.keys.messages(conversation_id), 0, -1).await;
        if !cached.is_empty() {
            return Ok(cached.len());
        }
        let rows = self.store
            .query(
                MESSAGES,
                &[("conversation_id", conversation_id)],
                self.args.max_messages_per_conversation
            ).await?;
        Ok(rows.len())
    }

    fn listing_invalidation(&self, owner: &str) -> Vec<CacheOp> {
        vec![
            CacheOp::Delete { key: self.keys.user_conversations(owner, true) },
            CacheOp::Delete { key: self.keys.user_conversations(owner, false) }
        ]
    }

    fn next_timestamp(&self) -> i64 {
        loop {
            let now = Utc::now().timestamp_millis();
            let last = self.clock.load(Ordering::SeqCst);
            let next = if now > last { now } else { last + 1 };
            if
                self.clock
                    .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return next;
            }
        }
    }
}

fn props_for<T: serde::Serialize>(value: &T) -> Result<Props> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ChatStoreError::Validation("record must serialize to an object".to_string())),
    }
}
