//! HTTP side of the client: the streaming generation request and the
//! persistence endpoints.
//!
//! One [`HttpBackend`] holds two `reqwest` clients. The persistence client
//! carries the configured request timeout; the streaming client only has a
//! connect timeout, since a generation may legitimately run for minutes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::de::DeserializeOwned;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::config::{join_url, ClientConfig};
use crate::conversation::{ConversationSummary, Message};
use crate::error::{ChatError, Result};
use crate::protocol::{
    ChatRequest, ConversationHistoryResponse, ConversationListResponse,
    CreateConversationResponse, MessageEdit,
};
use crate::session::{ByteStream, StreamTransport};

/// Persistence endpoints the store needs.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
    /// Messages of one conversation, oldest first.
    async fn get_conversation(&self, conversation_id: &str) -> Result<Vec<Message>>;
    /// Returns the new conversation id.
    async fn create_conversation(&self) -> Result<String>;
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
    async fn edit_message(&self, message_id: &str, content: &str) -> Result<()>;
}

pub struct HttpBackend {
    base_url: String,
    stream_url: String,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl HttpBackend {
    pub fn builder(base_url: impl Into<String>) -> HttpBackendBuilder {
        HttpBackendBuilder::new(base_url)
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let mut b = Self::builder(&config.base_url)
            .stream_path(&config.stream_path)
            .connect_timeout(config.connect_timeout());
        if let Some(t) = config.request_timeout() {
            b = b.request_timeout(t);
        }
        b.build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| backend_error(&url, e))?;
        let resp = ensure_success(resp, &url).await?;
        let bytes = resp.bytes().await.map_err(|e| backend_error(&url, e))?;
        serde_json::from_slice(&bytes).map_err(|e| ChatError::Json {
            context: url,
            detail: e.to_string(),
        })
    }
}

async fn ensure_success(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ChatError::Backend {
        url: url.to_string(),
        detail: format!("HTTP {}: {}", status.as_u16(), body.trim()),
    })
}

fn backend_error(url: &str, e: reqwest::Error) -> ChatError {
    ChatError::Backend {
        url: url.to_string(),
        detail: e.to_string(),
    }
}

#[async_trait]
impl StreamTransport for HttpBackend {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream> {
        debug!(
            url = %self.stream_url,
            conversation_id = request.conversation_id.as_deref().unwrap_or("-"),
            history = request.messages.len(),
            "opening generation stream"
        );
        let resp = self
            .stream_client
            .post(&self.stream_url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ChatError::from));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ConversationBackend for HttpBackend {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let body: ConversationListResponse = self.get_json(self.url("/conversations")).await?;
        Ok(body.conversations.into_iter().map(Into::into).collect())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let url = self.url(&format!("/conversations/{conversation_id}"));
        let body: ConversationHistoryResponse = self.get_json(url).await?;
        Ok(body.messages.into_iter().map(Into::into).collect())
    }

    async fn create_conversation(&self) -> Result<String> {
        let url = self.url("/create_conversation");
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| backend_error(&url, e))?;
        let resp = ensure_success(resp, &url).await?;
        let bytes = resp.bytes().await.map_err(|e| backend_error(&url, e))?;
        let body: CreateConversationResponse =
            serde_json::from_slice(&bytes).map_err(|e| ChatError::Json {
                context: url,
                detail: e.to_string(),
            })?;
        Ok(body.conversation_id)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let url = self.url(&format!("/conversations/{conversation_id}"));
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| backend_error(&url, e))?;
        ensure_success(resp, &url).await?;
        Ok(())
    }

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<()> {
        let url = self.url(&format!("/messages/{message_id}"));
        let resp = self
            .client
            .put(&url)
            .json(&MessageEdit { content })
            .send()
            .await
            .map_err(|e| backend_error(&url, e))?;
        ensure_success(resp, &url).await?;
        Ok(())
    }
}

/// Builder for [`HttpBackend`].
pub struct HttpBackendBuilder {
    base_url: String,
    stream_path: String,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl HttpBackendBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        let defaults = ClientConfig::default();
        let connect_timeout = defaults.connect_timeout();
        Self {
            base_url: base_url.into(),
            stream_path: defaults.stream_path,
            connect_timeout,
            request_timeout: None,
        }
    }

    pub fn stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds persistence calls only.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> HttpBackend {
        let mut persist = reqwest::Client::builder().connect_timeout(self.connect_timeout);
        if let Some(t) = self.request_timeout {
            persist = persist.timeout(t);
        }
        // Builder failure falls back to a default client rather than panicking.
        let client = persist.build().unwrap_or_default();
        let stream_client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .unwrap_or_default();

        let base_url = self.base_url.trim_end_matches('/').to_string();
        HttpBackend {
            stream_url: join_url(&base_url, &self.stream_path),
            base_url,
            client,
            stream_client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let b = HttpBackend::builder("http://127.0.0.1:4000/").build();
        assert_eq!(b.base_url(), "http://127.0.0.1:4000");
        assert_eq!(b.stream_url(), "http://127.0.0.1:4000/api/chat/send");
    }

    #[test]
    fn builder_starts_from_config_defaults() {
        let defaults = ClientConfig::default();
        let b = HttpBackendBuilder::new("http://h");
        assert_eq!(b.stream_path, defaults.stream_path);
        assert_eq!(b.connect_timeout, defaults.connect_timeout());
        assert!(b.request_timeout.is_none());
    }

    #[test]
    fn builder_custom_stream_path() {
        let b = HttpBackend::builder("http://h")
            .stream_path("chat/stream")
            .connect_timeout(Duration::from_millis(250))
            .request_timeout(Duration::from_secs(2))
            .build();
        assert_eq!(b.stream_url(), "http://h/chat/stream");
    }

    #[test]
    fn from_config_uses_config_urls() {
        let mut c = ClientConfig::default();
        c.base_url = "http://10.1.1.1:8080".into();
        c.stream_path = "/v2/send".into();
        let b = HttpBackend::from_config(&c);
        assert_eq!(b.stream_url(), "http://10.1.1.1:8080/v2/send");
        assert_eq!(b.url("/conversations/x"), "http://10.1.1.1:8080/conversations/x");
    }

    #[tokio::test]
    async fn unreachable_stream_host_is_transport_error() {
        // Port 9 (discard) on loopback is normally closed.
        let b = HttpBackend::builder("http://127.0.0.1:9")
            .connect_timeout(Duration::from_millis(200))
            .build();
        let req = crate::session::tests::request();
        match b.open(&req).await {
            Err(ChatError::Transport(_)) => {}
            Err(other) => panic!("expected transport error, got {other:?}"),
            Ok(_) => panic!("expected transport error, got a stream"),
        }
    }
}
