//! Top-level handle wiring the store, the HTTP backend and the notification
//! channel together.
//!
//! The client owns one `client_id` for its whole life. The same id scopes the
//! push connection and is sent with every generation request, so the store
//! can recognise notifications caused by its own sends.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::accumulator::ImageResolver;
use crate::backend::{ConversationBackend, HttpBackend};
use crate::channel::{
    ChannelConnector, ChannelEvent, ChannelSettings, NotificationChannel, WsConnector,
};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::session::StreamTransport;
use crate::store::{ConversationStore, Prompt, RequestDefaults, SessionHandle};

pub struct ChatClient {
    config: ClientConfig,
    client_id: String,
    store: ConversationStore,
    channel: Option<NotificationChannel>,
    forwarder: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// HTTP backend and transport built from `config`.
    pub fn new(config: ClientConfig) -> Self {
        let http = Arc::new(HttpBackend::from_config(&config));
        Self::with_parts(config, http.clone(), http, new_client_id())
    }

    pub fn with_parts(
        config: ClientConfig,
        backend: Arc<dyn ConversationBackend>,
        transport: Arc<dyn StreamTransport>,
        client_id: String,
    ) -> Self {
        let store = ConversationStore::new(
            backend,
            transport,
            ImageResolver::new(config.image_base_url()),
            RequestDefaults {
                model: config.model.clone(),
                system_prompt: config.system_prompt.clone(),
                client_id: client_id.clone(),
            },
        );
        Self {
            config,
            client_id,
            store,
            channel: None,
            forwarder: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Open the push channel over WebSocket at the configured URL.
    pub fn connect_notifications(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let connector = Arc::new(WsConnector::new(self.config.channel_url()));
        self.connect_notifications_with(connector)
    }

    /// Open the push channel. Notifications are applied to the store, and
    /// every channel event is also forwarded to the returned receiver.
    pub fn connect_notifications_with(
        &mut self,
        connector: Arc<dyn ChannelConnector>,
    ) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let settings = ChannelSettings::from_config(&self.config, self.client_id.clone());
        let (channel, mut events) = NotificationChannel::spawn(connector, settings);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let store = self.store.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ChannelEvent::Notification(n) = &event {
                    match store.handle_notification(n).await {
                        Ok(Some(id)) => debug!(conversation_id = %id, "reloaded after notification"),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, kind = e.kind(), "refresh after notification failed"),
                    }
                }
                let _ = out_tx.send(event);
            }
        });
        self.channel = Some(channel);
        self.forwarder = Some(forwarder);
        out_rx
    }

    pub fn channel(&self) -> Option<&NotificationChannel> {
        self.channel.as_ref()
    }

    pub async fn send(&self, prompt: Prompt) -> Result<SessionHandle> {
        self.store.send(prompt).await
    }

    pub async fn regenerate(&self, conversation_id: &str, message_id: &str) -> Result<SessionHandle> {
        self.store.regenerate(conversation_id, message_id).await
    }

    /// Stop the active conversation's generation: the server is asked to
    /// abort over the push channel, and the local session is cancelled so
    /// the partial reply is kept. Returns whether a local session was live.
    pub fn stop(&self) -> bool {
        if let Some(channel) = &self.channel {
            channel.send_stop();
        }
        match self.store.active_id() {
            Some(id) => self.store.stop(&id),
            None => false,
        }
    }

    /// Host became visible again: reconnect the channel if it is not open
    /// and refresh once.
    pub async fn on_foreground(&self) -> Result<()> {
        if let Some(channel) = &self.channel {
            channel.on_foreground();
        }
        self.store.refresh().await
    }

    pub async fn shutdown(self) {
        if let Some(channel) = self.channel {
            channel.shutdown().await;
        }
        if let Some(forwarder) = self.forwarder {
            let _ = forwarder.await;
        }
    }
}

/// Identifier scoping the push channel and tagging outbound requests.
pub fn new_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique_uuids() {
        let a = new_client_id();
        let b = new_client_id();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[tokio::test]
    async fn new_client_has_no_channel() {
        let client = ChatClient::new(ClientConfig::default());
        assert!(client.channel().is_none());
        assert!(!client.stop());
        assert_eq!(client.config().model, "deepseek-chat");
        assert!(client.store().active_id().is_none());
    }
}
