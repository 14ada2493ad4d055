//! Crate-level error type.
//!
//! One variant per failure class a conversation client can hit. Only
//! `Transport`, `Http` and `ServerSignalled` ever reach the user as a failed
//! message; `StreamParse` is recovered inside the decoder, `Cancelled` turns
//! into an interrupted-but-preserved reply and `ChannelDisconnect` only feeds
//! the reconnect loop.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Connection refused, DNS failure, reset mid-read.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success status before streaming began.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A record carried the stream prefix but its payload did not parse.
    #[error("malformed stream record: {detail}")]
    StreamParse { detail: String, record: String },

    /// The backend sent an `error` event.
    #[error("{0}")]
    ServerSignalled(String),

    /// User stop or supersession by a newer session.
    #[error("generation cancelled")]
    Cancelled,

    /// The notification channel closed without being asked to.
    #[error("notification channel disconnected: {0}")]
    ChannelDisconnect(String),

    /// A persistence endpoint answered, but not with what we asked for.
    #[error("backend error on {url}: {detail}")]
    Backend { url: String, detail: String },

    #[error("unexpected JSON in {context}: {detail}")]
    Json { context: String, detail: String },

    /// A conversation or message id the store does not know.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ChatError {
    /// Cancellation is an outcome, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Transport(_) => "transport",
            ChatError::Http { .. } => "http",
            ChatError::StreamParse { .. } => "stream_parse",
            ChatError::ServerSignalled(_) => "server_signalled",
            ChatError::Cancelled => "cancelled",
            ChatError::ChannelDisconnect(_) => "channel_disconnect",
            ChatError::Backend { .. } => "backend",
            ChatError::Json { .. } => "json",
            ChatError::NotFound(_) => "not_found",
            ChatError::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ChatError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => ChatError::Transport(e.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::ChannelDisconnect(e.to_string())
    }
}
