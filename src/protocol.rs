use serde::{Deserialize, Serialize};

use crate::conversation::Role;

// -- Stream records ---------------------------------------------------------

/// Prefix carried by every payload-bearing line of the generation stream.
pub const RECORD_PREFIX: &str = "data:";

/// Sentinel some backends send instead of a `done` record.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Literal text frame asking the server to abort this client's generation.
pub const STOP_GENERATION: &str = "stop_generation";

/// One retrieval snippet attached to a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    #[serde(rename = "fileName", alias = "file_name", default)]
    pub file_name: String,
    #[serde(default)]
    pub similarity: f64,
    #[serde(default)]
    pub content: String,
}

/// Image payload as the backend sends it: either inline base64 or a server
/// path that must be joined onto the image base URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_index: Option<u32>,
}

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Reasoning(String),
    Context(Vec<ContextSnippet>),
    Image(ImageDescriptor),
    Error(String),
    Done,
}

impl StreamEvent {
    /// `error` and `done` end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_) | StreamEvent::Done)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Content(_) => "content",
            StreamEvent::Reasoning(_) => "reasoning",
            StreamEvent::Context(_) => "context",
            StreamEvent::Image(_) => "image",
            StreamEvent::Error(_) => "error",
            StreamEvent::Done => "done",
        }
    }
}

/// Untyped `{type, content}` envelope; `content` is interpreted per `type`.
#[derive(Debug, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

// -- Outbound generation request -------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

/// A file sent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64-encoded file body.
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine as _;
        let name = name.into();
        Attachment {
            mime_type: guess_mime(&name).to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            name,
        }
    }

    /// Read and encode a file from disk.
    pub async fn from_path(path: &std::path::Path) -> crate::error::Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            crate::error::ChatError::Config(format!("cannot read attachment {}: {e}", path.display()))
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::from_bytes(name, &bytes))
    }
}

fn guess_mime(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "md" | "log" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Absent to let the backend create the conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub client_id: String,
    /// Prior turns, oldest first.
    pub messages: Vec<WireMessage>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regenerate_message_id: Option<String>,
}

// -- Notification channel ---------------------------------------------------

/// Coarse "something changed" signal pushed over the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    ConversationCreated {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    ConversationDeleted {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    MessageAdded {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    MessageEdited {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    SummaryUpdated {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

impl NotificationEvent {
    /// Conversation the event is about, when the server said so.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            NotificationEvent::ConversationCreated { conversation_id, .. }
            | NotificationEvent::ConversationDeleted { conversation_id, .. }
            | NotificationEvent::MessageAdded { conversation_id, .. }
            | NotificationEvent::SummaryUpdated { conversation_id, .. } => Some(conversation_id),
            NotificationEvent::MessageEdited { conversation_id, .. } => conversation_id.as_deref(),
        }
    }

    /// Client whose action produced the event, if the server echoed it.
    pub fn origin(&self) -> Option<&str> {
        match self {
            NotificationEvent::ConversationCreated { client_id, .. }
            | NotificationEvent::ConversationDeleted { client_id, .. }
            | NotificationEvent::MessageAdded { client_id, .. }
            | NotificationEvent::MessageEdited { client_id, .. }
            | NotificationEvent::SummaryUpdated { client_id, .. } => client_id.as_deref(),
        }
    }
}

// -- Persistence endpoints --------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationListResponse {
    #[serde(default)]
    pub conversations: Vec<ConversationRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationRecord {
    #[serde(alias = "id")]
    pub conversation_id: String,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub last_updated: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub message_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationHistoryResponse {
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRecord {
    #[serde(alias = "id", default)]
    pub message_id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConversationResponse {
    #[serde(alias = "id")]
    pub conversation_id: String,
}

#[derive(Debug, Serialize)]
pub struct MessageEdit<'a> {
    pub content: &'a str,
}
