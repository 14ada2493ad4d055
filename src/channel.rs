//! # Stage: Notification Channel
//!
//! ## Responsibility
//! Keep one push connection open per client id, turn inbound frames into
//! [`NotificationEvent`]s and carry the outbound `stop_generation` signal.
//!
//! ## State machine
//! `Connecting -> Open -> Closed -> (fixed delay) -> Connecting`. The worker
//! task owns the connection and the single retry timer; callers talk to it
//! through commands. A foreground signal while `Closed` skips the rest of the
//! delay.
//!
//! ## Guarantees
//! - Every status change is published on a `watch` channel and as a
//!   [`ChannelEvent::Status`], in order.
//! - Malformed frames are dropped with a warning; they never close the
//!   connection.
//! - Disconnects are logged at `warn`, escalating to `error` once consecutive
//!   failures reach the configured threshold. They are never surfaced
//!   otherwise.
//!
//! ## NOT Responsible For
//! - Deciding what to refresh (see `store`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::protocol::{NotificationEvent, STOP_GENERATION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Connecting => write!(f, "connecting"),
            ChannelStatus::Open => write!(f, "open"),
            ChannelStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Notification(NotificationEvent),
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn ChannelConnection>>;
}

/// One established push connection.
#[async_trait]
pub trait ChannelConnection: Send {
    /// Next inbound text frame. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String>>;
    async fn send_text(&mut self, text: &str) -> Result<()>;
    async fn close(&mut self);
}

/// WebSocket connector: `{channel_url}/{client_id}`.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(channel_url: impl Into<String>) -> Self {
        Self {
            url: channel_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, client_id: &str) -> String {
        format!("{}/{}", self.url, client_id)
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn ChannelConnection>> {
        let url = self.endpoint(client_id);
        let (ws, _) = connect_async(url.as_str()).await?;
        debug!(url = %url, "websocket handshake complete");
        Ok(Box::new(WsConnection { ws }))
    }
}

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ChannelConnection for WsConnection {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(_)) => return None,
                // Pings are answered by tungstenite on the next read.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws.send(WsMessage::Text(text.to_string())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ---------------------------------------------------------------------------
// Channel handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub client_id: String,
    pub reconnect_delay: Duration,
    pub failure_log_threshold: u32,
}

impl ChannelSettings {
    pub fn from_config(config: &ClientConfig, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            reconnect_delay: config.reconnect_delay(),
            failure_log_threshold: config.failure_log_threshold,
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(String),
    Reconnect,
    Shutdown,
}

pub struct NotificationChannel {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ChannelStatus>,
    task: JoinHandle<()>,
}

impl NotificationChannel {
    /// Start the worker. Events arrive on the returned receiver until the
    /// channel is shut down.
    pub fn spawn(
        connector: Arc<dyn ChannelConnector>,
        settings: ChannelSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Closed);
        let worker = Worker {
            connector,
            settings,
            commands: cmd_rx,
            events: event_tx,
            status: status_tx,
            consecutive_failures: 0,
        };
        let task = tokio::spawn(worker.run());
        (
            Self {
                commands: cmd_tx,
                status: status_rx,
                task,
            },
            event_rx,
        )
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Ask the server to abort this client's generation. Returns `false`
    /// when the channel is not open; the signal is not queued for later.
    pub fn send_stop(&self) -> bool {
        if self.status() != ChannelStatus::Open {
            debug!("notification channel not open, stop signal not sent");
            return false;
        }
        self.commands
            .send(Command::Send(STOP_GENERATION.to_string()))
            .is_ok()
    }

    /// Host regained foreground: reconnect now unless already open. Returns
    /// whether a reconnect was requested.
    pub fn on_foreground(&self) -> bool {
        if self.status() == ChannelStatus::Open {
            return false;
        }
        self.commands.send(Command::Reconnect).is_ok()
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!(error = %e, "notification channel task failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    connector: Arc<dyn ChannelConnector>,
    settings: ChannelSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    status: watch::Sender<ChannelStatus>,
    consecutive_failures: u32,
}

/// Why an open connection stopped being read.
enum Ended {
    PeerClosed,
    Failed(ChatError),
    Shutdown,
}

enum Step {
    Command(Option<Command>),
    Frame(Option<Result<String>>),
}

impl Worker {
    async fn run(mut self) {
        loop {
            self.set_status(ChannelStatus::Connecting);
            match self.connector.connect(&self.settings.client_id).await {
                Ok(mut conn) => {
                    self.consecutive_failures = 0;
                    self.set_status(ChannelStatus::Open);
                    info!(client_id = %self.settings.client_id, "notification channel open");
                    let ended = self.pump(conn.as_mut()).await;
                    conn.close().await;
                    self.set_status(ChannelStatus::Closed);
                    match ended {
                        Ended::Shutdown => break,
                        Ended::PeerClosed => {
                            self.record_failure(&ChatError::ChannelDisconnect("closed by peer".into()))
                        }
                        Ended::Failed(e) => self.record_failure(&e),
                    }
                }
                Err(e) => {
                    self.set_status(ChannelStatus::Closed);
                    self.record_failure(&e);
                }
            }
            if !self.wait_retry().await {
                break;
            }
        }
        debug!(client_id = %self.settings.client_id, "notification channel stopped");
    }

    async fn pump(&mut self, conn: &mut dyn ChannelConnection) -> Ended {
        loop {
            let step = tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Command(cmd),
                frame = conn.recv() => Step::Frame(frame),
            };
            match step {
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => return Ended::Shutdown,
                Step::Command(Some(Command::Reconnect)) => {}
                Step::Command(Some(Command::Send(text))) => {
                    if let Err(e) = conn.send_text(&text).await {
                        return Ended::Failed(e);
                    }
                    debug!(frame = %text, "control frame sent");
                }
                Step::Frame(None) => return Ended::PeerClosed,
                Step::Frame(Some(Err(e))) => return Ended::Failed(e),
                Step::Frame(Some(Ok(text))) => self.dispatch(&text),
            }
        }
    }

    /// Sleep out the reconnect delay. Returns `false` on shutdown.
    async fn wait_retry(&mut self) -> bool {
        let timer = tokio::time::sleep(self.settings.reconnect_delay);
        tokio::pin!(timer);
        loop {
            let cmd = tokio::select! {
                biased;
                cmd = self.commands.recv() => cmd,
                _ = &mut timer => return true,
            };
            match cmd {
                None | Some(Command::Shutdown) => return false,
                Some(Command::Reconnect) => {
                    debug!("reconnecting ahead of retry timer");
                    return true;
                }
                Some(Command::Send(text)) => {
                    debug!(frame = %text, "notification channel closed, dropping control frame");
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<NotificationEvent>(text) {
            Ok(event) => {
                debug!(?event, "notification received");
                let _ = self.events.send(ChannelEvent::Notification(event));
            }
            Err(e) => warn!(error = %e, frame = text, "dropping malformed notification"),
        }
    }

    fn record_failure(&mut self, e: &ChatError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay_ms = self.settings.reconnect_delay.as_millis() as u64;
        if self.consecutive_failures >= self.settings.failure_log_threshold {
            error!(
                error = %e,
                client_id = %self.settings.client_id,
                consecutive_failures = self.consecutive_failures,
                delay_ms,
                "notification channel keeps failing, will retry"
            );
        } else {
            warn!(
                error = %e,
                client_id = %self.settings.client_id,
                delay_ms,
                "notification channel closed, will retry"
            );
        }
    }

    fn set_status(&self, next: ChannelStatus) {
        let prev = self.status.send_replace(next);
        if prev != next {
            let _ = self.events.send(ChannelEvent::Status(next));
        }
    }
}
