use log::warn;
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::keys::KeySpace;
use crate::cache::DistributedCache;
use crate::error::Result;
use crate::hierarchy::HierarchyIndex;
use crate::models::{ ChatMessage, ContextEntry };
use crate::store::{ DurableStore, MESSAGES };

/// How many recent messages each sibling or descendant may contribute when
/// the whole subtree is pulled in.
const SIDE_CHAT_MESSAGE_LIMIT: usize = 5;

/// Builds model-ready context for a conversation by merging message streams
/// across its subtree. Read-only: never repopulates caches, and message reads
/// fall through to the durable store whenever the distributed cache has
/// nothing to offer.
pub struct ContextAssembler {
    cache: Arc<dyn DistributedCache>,
    store: Arc<dyn DurableStore>,
    hierarchy: Arc<HierarchyIndex>,
    keys: KeySpace,
    message_cap: usize,
}

impl ContextAssembler {
    pub fn new(
        cache: Arc<dyn DistributedCache>,
        store: Arc<dyn DurableStore>,
        hierarchy: Arc<HierarchyIndex>,
        keys: KeySpace,
        message_cap: usize
    ) -> Self {
        Self { cache, store, hierarchy, keys, message_cap }
    }

    /// Assembles up to `budget` entries for `conversation_id` (up to twice
    /// that when the conversation inherits context, so inherited narrative is
    /// not crowded out).
    ///
    /// Inheritance is bounded to two ancestor levels: the parent contributes
    /// at most `budget / 2` recent messages and the grandparent at most
    /// `budget / 4`, with the target filling the remainder. With
    /// `include_all_descendants`, every tree member that is not the target or
    /// one of its ancestors adds up to five recent messages. Candidates merge
    /// into ascending timestamp order; ties keep gathering order.
    pub async fn assemble(
        &self,
        conversation_id: &str,
        budget: usize,
        include_all_descendants: bool
    ) -> Result<Vec<ContextEntry>> {
        if budget == 0 {
            return Ok(Vec::new());
        }
        let target = match self.hierarchy.load_conversation(conversation_id).await? {
            Some(conversation) => conversation,
            None => {
                return Ok(Vec::new());
            }
        };

        let mut candidates: Vec<ChatMessage> = Vec::new();

        if target.inherit_context {
            if let Some(parent_id) = target.parent_id.as_deref() {
                if let Some(parent) = self.hierarchy.load_conversation(parent_id).await? {
                    let parent_messages = self.load_messages(&parent.id).await?;
                    candidates.extend(most_recent(parent_messages, budget / 2));

                    if let Some(grandparent_id) = parent.parent_id.as_deref() {
                        let grandparent_messages = self.load_messages(grandparent_id).await?;
                        candidates.extend(most_recent(grandparent_messages, budget / 4));
                    }
                }
            }
        }

        let remaining = budget.saturating_sub(candidates.len());
        let own_messages = self.load_messages(conversation_id).await?;
        candidates.extend(most_recent(own_messages, remaining));

        if include_all_descendants {
            // Ancestors are neither siblings nor descendants of the target;
            // the inheritance path above is their only way in.
            let mut ancestors: HashSet<String> = HashSet::new();
            let mut cursor = target.parent_id.clone();
            while let Some(ancestor_id) = cursor {
                if !ancestors.insert(ancestor_id.clone()) {
                    break;
                }
                cursor = match self.hierarchy.load_conversation(&ancestor_id).await? {
                    Some(ancestor) => ancestor.parent_id.clone(),
                    None => None,
                };
            }

            let main_id = self.hierarchy.resolve_main_chat(conversation_id).await?;
            let mut tree = vec![main_id.clone()];
            tree.extend(self.hierarchy.list_descendants(&main_id).await?);
            for member in tree {
                if member == conversation_id || ancestors.contains(&member) {
                    continue;
                }
                let side_messages = self.load_messages(&member).await?;
                candidates.extend(most_recent(side_messages, SIDE_CHAT_MESSAGE_LIMIT));
            }
        }

        // Vec::sort_by_key is stable, so equal timestamps keep gathering order.
        candidates.sort_by_key(|message| message.timestamp);

        let cap = if target.inherit_context { budget.saturating_mul(2) } else { budget };
        let trimmed = most_recent(candidates, cap);
        Ok(
            trimmed
                .into_iter()
                .map(|message| ContextEntry { role: message.role, content: message.content })
                .collect()
        )
    }

    /// Messages of one conversation in chronological order. The cached list
    /// is newest-first; an empty or unreachable cache falls through to a
    /// durable-store query. Also serves the facade's tree activity reads.
    pub(crate) async fn load_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let cached = self.cache.list_range(&self.keys.messages(conversation_id), 0, -1).await;
        if !cached.is_empty() {
            let mut messages: Vec<ChatMessage> = cached
                .iter()
                .filter_map(|raw| match serde_json::from_str::<ChatMessage>(raw) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Skipping malformed cached message in {}: {}", conversation_id, e);
                        None
                    }
                })
                .collect();
            messages.reverse();
            return Ok(messages);
        }

        let rows = self.store
            .query(MESSAGES, &[("conversation_id", conversation_id)], self.message_cap).await?;
        let mut messages: Vec<ChatMessage> = rows
            .into_iter()
            .filter_map(|props| {
                match serde_json::from_value::<ChatMessage>(serde_json::Value::Object(props)) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Skipping malformed stored message in {}: {}", conversation_id, e);
                        None
                    }
                }
            })
            .collect();
        messages.sort_by_key(|message| message.timestamp);
        Ok(messages)
    }
}

fn most_recent(mut messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    if messages.len() > limit {
        messages.split_off(messages.len() - limit)
    } else {
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::models::Conversation;
    use crate::store::memory::MemoryObjectStore;
    use crate::store::{ Props, CONVERSATIONS };

    struct Fixture {
        cache: Arc<MemoryCache>,
        store: Arc<MemoryObjectStore>,
        assembler: ContextAssembler,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryObjectStore::new());
        let hierarchy = Arc::new(
            HierarchyIndex::new(
                cache.clone() as Arc<dyn DistributedCache>,
                store.clone() as Arc<dyn DurableStore>,
                KeySpace::new("chat"),
                3600
            )
        );
        let assembler = ContextAssembler::new(
            cache.clone() as Arc<dyn DistributedCache>,
            store.clone() as Arc<dyn DurableStore>,
            hierarchy,
            KeySpace::new("chat"),
            500
        );
        Fixture { cache, store, assembler }
    }

    fn props_of<T: serde::Serialize>(value: &T) -> Props {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Props::new(),
        }
    }

    async fn seed_conversation(
        fx: &Fixture,
        id: &str,
        parent: Option<&str>,
        inherit_context: bool
    ) {
        let conversation = Conversation {
            id: id.to_string(),
            owner: "u1".to_string(),
            title: id.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            created_at: 1,
            updated_at: 1,
            inherit_context,
            depth: if parent.is_some() { 1 } else { 0 },
        };
        fx.store
            .create_with_id(CONVERSATIONS, id, props_of(&conversation)).await
            .expect("seed conversation");
    }

    async fn seed_message(fx: &Fixture, conversation_id: &str, role: &str, content: &str, ts: i64) {
        let message = ChatMessage {
            id: format!("{}-{}", conversation_id, ts),
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp: ts,
        };
        fx.store
            .create_with_id(MESSAGES, &message.id, props_of(&message)).await
            .expect("seed message");
    }

    fn contents(entries: &[ContextEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.content.as_str()).collect()
    }

    #[tokio::test]
    async fn inherited_parent_message_precedes_own() {
        let fx = fixture();
        seed_conversation(&fx, "main", None, false).await;
        seed_conversation(&fx, "sub", Some("main"), true).await;
        seed_message(&fx, "main", "user", "hello", 1).await;
        seed_message(&fx, "sub", "user", "hi", 2).await;

        let entries = fx.assembler.assemble("sub", 10, false).await.expect("assemble");
        assert_eq!(contents(&entries), vec!["hello", "hi"]);
        assert_eq!(entries[0].role, "user");
    }

    #[tokio::test]
    async fn grandparent_contributes_within_quarter_budget() {
        let fx = fixture();
        seed_conversation(&fx, "root", None, false).await;
        seed_conversation(&fx, "mid", Some("root"), true).await;
        seed_conversation(&fx, "leaf", Some("mid"), true).await;
        for ts in 0..6 {
            seed_message(&fx, "root", "user", &format!("root-{}", ts), ts).await;
        }
        seed_message(&fx, "mid", "assistant", "mid-0", 10).await;
        seed_message(&fx, "leaf", "user", "leaf-0", 20).await;

        // budget 8: parent <= 4, grandparent <= 2, target fills the rest.
        let entries = fx.assembler.assemble("leaf", 8, false).await.expect("assemble");
        assert_eq!(contents(&entries), vec!["root-4", "root-5", "mid-0", "leaf-0"]);
    }

    #[tokio::test]
    async fn budget_bounds_result_when_not_inheriting() {
        let fx = fixture();
        seed_conversation(&fx, "solo", None, false).await;
        for ts in 0..10 {
            seed_message(&fx, "solo", "user", &format!("m{}", ts), ts).await;
        }

        let entries = fx.assembler.assemble("solo", 3, false).await.expect("assemble");
        assert_eq!(contents(&entries), vec!["m7", "m8", "m9"]);
    }

    #[tokio::test]
    async fn siblings_add_at_most_five_messages_each() {
        let fx = fixture();
        seed_conversation(&fx, "main", None, false).await;
        seed_conversation(&fx, "a", Some("main"), false).await;
        seed_conversation(&fx, "b", Some("main"), false).await;
        for ts in 0..8 {
            seed_message(&fx, "b", "user", &format!("b{}", ts), ts).await;
        }
        seed_message(&fx, "a", "user", "a-own", 100).await;

        let entries = fx.assembler.assemble("a", 20, true).await.expect("assemble");
        // b contributes its five newest, a its own message, main has none.
        assert_eq!(contents(&entries), vec!["b3", "b4", "b5", "b6", "b7", "a-own"]);
    }

    #[tokio::test]
    async fn ancestors_stay_out_of_the_side_chat_fan_in() {
        let fx = fixture();
        seed_conversation(&fx, "main", None, false).await;
        seed_conversation(&fx, "sub", Some("main"), false).await;
        seed_conversation(&fx, "sib", Some("main"), false).await;
        seed_message(&fx, "main", "user", "main-0", 1).await;
        seed_message(&fx, "main", "assistant", "main-1", 2).await;
        seed_message(&fx, "sib", "user", "sib-0", 3).await;
        seed_message(&fx, "sub", "user", "sub-0", 4).await;

        // "sub" does not inherit, so nothing of "main" may enter; its
        // sibling still contributes.
        let entries = fx.assembler.assemble("sub", 10, true).await.expect("assemble");
        assert_eq!(contents(&entries), vec!["sib-0", "sub-0"]);

        // Two levels down, both "sub" and "main" are ancestors.
        seed_conversation(&fx, "leaf", Some("sub"), false).await;
        seed_message(&fx, "leaf", "user", "leaf-0", 5).await;
        let deeper = fx.assembler.assemble("leaf", 10, true).await.expect("assemble");
        assert_eq!(contents(&deeper), vec!["sib-0", "leaf-0"]);
    }

    #[tokio::test]
    async fn inheriting_target_may_exceed_budget_up_to_double() {
        let fx = fixture();
        seed_conversation(&fx, "main", None, false).await;
        seed_conversation(&fx, "sub", Some("main"), true).await;
        for sibling in ["s1", "s2", "s3"] {
            seed_conversation(&fx, sibling, Some("main"), false).await;
            for ts in 0..5 {
                seed_message(&fx, sibling, "user", &format!("{}-{}", sibling, ts), ts).await;
            }
        }
        for ts in 10..14 {
            seed_message(&fx, "main", "user", &format!("main-{}", ts), ts).await;
        }
        for ts in 20..24 {
            seed_message(&fx, "sub", "user", &format!("sub-{}", ts), ts).await;
        }

        let inherit = fx.assembler.assemble("sub", 8, true).await.expect("assemble");
        assert!(inherit.len() > 8, "inheriting target should keep overflow");
        assert!(inherit.len() <= 16);

        seed_conversation(&fx, "flat", Some("main"), false).await;
        for ts in 30..34 {
            seed_message(&fx, "flat", "user", &format!("flat-{}", ts), ts).await;
        }
        let capped = fx.assembler.assemble("flat", 8, true).await.expect("assemble");
        assert_eq!(capped.len(), 8);
    }

    #[tokio::test]
    async fn falls_back_to_store_when_cache_is_down() {
        let fx = fixture();
        seed_conversation(&fx, "solo", None, false).await;
        seed_message(&fx, "solo", "user", "persisted", 1).await;
        fx.cache.set_available(false);

        let entries = fx.assembler.assemble("solo", 5, false).await.expect("assemble");
        assert_eq!(contents(&entries), vec!["persisted"]);
    }

    #[tokio::test]
    async fn prefers_cached_messages_over_store() {
        let fx = fixture();
        seed_conversation(&fx, "solo", None, false).await;
        seed_message(&fx, "solo", "user", "stale-store-copy", 1).await;

        let keys = KeySpace::new("chat");
        let cached = ChatMessage {
            id: "m1".to_string(),
            conversation_id: "solo".to_string(),
            role: "user".to_string(),
            content: "fresh".to_string(),
            timestamp: 2,
        };
        let encoded = serde_json::to_string(&cached).expect("encode");
        fx.cache.list_push(&keys.messages("solo"), &encoded).await;

        let entries = fx.assembler.assemble("solo", 5, false).await.expect("assemble");
        assert_eq!(contents(&entries), vec!["fresh"]);
    }

    #[tokio::test]
    async fn unknown_conversation_yields_empty_context() {
        let fx = fixture();
        let entries = fx.assembler.assemble("missing", 5, false).await.expect("assemble");
        assert!(entries.is_empty());
    }
}
