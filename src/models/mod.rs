use serde::{ Serialize, Deserialize };

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub inherit_context: bool,
    pub depth: u32,
}

impl Conversation {
    pub fn is_main_chat(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: i64,
}

/// Back-pointer stored for each sub-chat, pointing at the root of its tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubChatPointer {
    pub main_chat_id: String,
    pub owner: String,
    pub created_at: i64,
}

/// Model-ready context line with all bookkeeping stripped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HierarchyStats {
    pub conversation_id: String,
    pub main_chat_id: String,
    pub is_main_chat: bool,
    pub total_sub_chats: usize,
    pub sub_chat_ids: Vec<String>,
    pub total_messages_in_tree: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareToken {
    pub token: String,
    pub conversation_id: String,
    pub expires_at: i64,
}
