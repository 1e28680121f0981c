use sha2::{ Digest, Sha256 };

/// Hash length in hex characters. 20 hex chars = 80 bits, enough to make
/// collisions negligible while keeping keys short.
const KEY_HASH_LEN: usize = 20;

/// Derives the distributed-cache keys for one namespace. Structured names
/// (`resource:id`) are hashed so user-supplied ids never leak into the
/// keyspace and key length stays bounded.
#[derive(Clone, Debug)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_string() }
    }

    fn derive(&self, name: &str) -> String {
        let digest = hex::encode(Sha256::digest(name.as_bytes()));
        format!("{}:{}", self.prefix, &digest[..KEY_HASH_LEN])
    }

    /// Conversation metadata record.
    pub fn metadata(&self, conversation_id: &str) -> String {
        self.derive(&format!("meta:{}", conversation_id))
    }

    /// Per-conversation message list.
    pub fn messages(&self, conversation_id: &str) -> String {
        self.derive(&format!("messages:{}", conversation_id))
    }

    /// Main-chat side of a hierarchy edge: JSON array of descendant ids.
    pub fn hierarchy_main(&self, main_chat_id: &str) -> String {
        self.derive(&format!("hierarchy:main:{}", main_chat_id))
    }

    /// Sub-chat side of a hierarchy edge: back-pointer to the main chat.
    pub fn hierarchy_sub(&self, sub_chat_id: &str) -> String {
        self.derive(&format!("hierarchy:sub:{}", sub_chat_id))
    }

    /// Rolling list of recent messages across a whole tree, keyed by its
    /// main chat.
    pub fn tree_context(&self, main_chat_id: &str) -> String {
        self.derive(&format!("tree:{}", main_chat_id))
    }

    /// Cached per-user conversation listing.
    pub fn user_conversations(&self, owner: &str, include_sub_chats: bool) -> String {
        let scope = if include_sub_chats { "all" } else { "main" };
        self.derive(&format!("user:{}:conversations:{}", owner, scope))
    }

    pub fn share_token(&self, token: &str) -> String {
        self.derive(&format!("share:{}", token))
    }

    /// Reverse index: every key written on behalf of a conversation is also
    /// recorded here so deletion can purge without rederiving or scanning.
    pub fn reverse_index(&self, conversation_id: &str) -> String {
        self.derive(&format!("keyindex:{}", conversation_id))
    }

    /// Scan pattern matching any key in this namespace that still carries
    /// `token` verbatim. Current keys are hashed and never match; this exists
    /// to sweep keys written by older derivations during deletion.
    pub fn scan_pattern(&self, token: &str) -> String {
        format!("{}:*{}*", self.prefix, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys_are_deterministic() {
        let ks = KeySpace::new("chat");
        assert_eq!(ks.metadata("abc"), ks.metadata("abc"));
        assert_eq!(ks.messages("abc"), ks.messages("abc"));
    }

    #[test]
    fn derived_keys_are_distinct_per_resource() {
        let ks = KeySpace::new("chat");
        let keys = [
            ks.metadata("abc"),
            ks.messages("abc"),
            ks.hierarchy_main("abc"),
            ks.hierarchy_sub("abc"),
            ks.tree_context("abc"),
            ks.reverse_index("abc"),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn derived_keys_have_fixed_shape() {
        let ks = KeySpace::new("chat");
        let key = ks.metadata("some-very-long-conversation-identifier-that-would-bloat-keys");
        assert_eq!(key.len(), "chat:".len() + 20);
        assert!(key.starts_with("chat:"));
    }

    #[test]
    fn listing_scope_changes_the_key() {
        let ks = KeySpace::new("chat");
        assert_ne!(
            ks.user_conversations("u1", true),
            ks.user_conversations("u1", false)
        );
    }
}
