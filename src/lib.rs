//! Streaming conversation client.
//!
//! A reply arrives as newline-delimited `data:` records over a chunked HTTP
//! body. Each send runs as a [`session::StreamSession`]:
//!
//! ```text
//! bytes -> LineReassembler -> decode -> Accumulator -> ConversationStore
//! ```
//!
//! A separate [`channel::NotificationChannel`] keeps a WebSocket open and
//! turns server pushes into store refreshes.

pub mod accumulator;
pub mod backend;
pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod protocol;
pub mod reassembler;
pub mod session;
pub mod store;

pub use accumulator::{Draft, DraftStatus};
pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{ChatError, Result};
pub use session::SessionState;
pub use store::{ConversationStore, Prompt, SessionHandle};

/// Seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    #[test]
    fn now_secs_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(super::now_secs() > 1_577_836_800.0);
    }
}
