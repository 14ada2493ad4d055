//! Conversation data model: messages as the store holds them.

use serde::{Deserialize, Serialize};

use crate::protocol::{ContextSnippet, MessageRecord, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// An image resolved to something presentation can display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Absolute URL or `data:` URL.
    pub url: String,
    /// De-duplication key: the URL for remote images, a content hash for
    /// inline ones.
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A finalized message. Never mutated after it lands in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server id once persisted; locally created messages carry a local uuid.
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextSnippet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub error: bool,
    /// What went wrong, when `error` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Message {
            id: local_id(),
            role,
            content: content.into(),
            reasoning_content: None,
            context: Vec::new(),
            images: Vec::new(),
            interrupted: false,
            error: false,
            error_detail: None,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

impl From<MessageRecord> for Message {
    fn from(r: MessageRecord) -> Self {
        let mut m = Message::plain(r.role, r.content);
        if let Some(id) = r.message_id {
            m.id = id;
        }
        m
    }
}

/// Locally generated id for messages not yet known to the server.
pub fn local_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4())
}

/// A conversation and its messages in temporal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    /// Unix seconds.
    pub created_at: f64,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Conversation {
            id: id.into(),
            title: String::new(),
            messages: Vec::new(),
            created_at: crate::now_secs(),
        }
    }

    /// Prior turns in request form. System turns are carried separately as
    /// the request's system prompt.
    pub fn wire_history(&self) -> Vec<WireMessage> {
        self.wire_history_until(self.messages.len())
    }

    /// Like [`wire_history`](Self::wire_history) but only the first `end`
    /// messages.
    pub fn wire_history_until(&self, end: usize) -> Vec<WireMessage> {
        self.messages[..end.min(self.messages.len())]
            .iter()
            .filter(|m| m.role != Role::System && !m.error)
            .map(Message::to_wire)
            .collect()
    }

    pub fn position_of(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub message_count: u32,
}

impl From<crate::protocol::ConversationRecord> for ConversationSummary {
    fn from(r: crate::protocol::ConversationRecord) -> Self {
        ConversationSummary {
            id: r.conversation_id,
            created_at: r.created_at,
            summary: r.summary,
            message_count: r.message_count.unwrap_or(0),
        }
    }
}
