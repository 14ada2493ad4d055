//! # Stage: Stream Session
//!
//! ## Responsibility
//! Drive one generation request end to end: open the transport, pump bytes
//! through reassembler -> decoder -> accumulator, and commit the result.
//!
//! ## State machine
//! `Idle -> Sending -> Streaming -> {Completed | Errored | Aborted}`.
//! A failed open goes straight from `Sending` to `Errored`.
//!
//! ## Guarantees
//! - The read loop is the only place reads are issued. Each read is raced
//!   against the cancellation token; once cancelled, the pending read is
//!   dropped and no further read is made.
//! - Every exit path converges on [`StreamSession::finalize`], which appends
//!   exactly one message to the sink no matter how often it is reached.
//! - The terminal state is published only after the sink has the message.
//! - A transport that closes without a `done` record completes the session.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{Accumulator, Draft, DraftStatus, ImageResolver};
use crate::conversation::Message;
use crate::decoder::decode;
use crate::error::{ChatError, Result};
use crate::protocol::ChatRequest;
use crate::reassembler::LineReassembler;

/// Raw response body as an ordered stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opens the streaming response for a request. A non-success status must
/// come back as [`ChatError::Http`] before any body is read.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<ByteStream>;
}

/// Where finalized replies go.
pub trait MessageSink: Send + Sync {
    fn append_message(&self, conversation_id: &str, message: Message);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Sending,
    Streaming,
    Completed,
    Errored,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Errored | SessionState::Aborted
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Sending => "sending",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Errored => "errored",
            SessionState::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// What a finished session produced.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub conversation_id: String,
    pub state: SessionState,
    /// The message handed to the sink.
    pub message: Message,
}

/// Why the read loop stopped.
enum StreamEnd {
    /// A `done` or `error` record arrived.
    Terminal,
    /// The transport ran out of bytes.
    Closed,
    Failed(ChatError),
    Cancelled,
}

pub struct StreamSession {
    conversation_id: String,
    state_tx: watch::Sender<SessionState>,
    accumulator: Accumulator,
    reassembler: LineReassembler,
    cancel: CancellationToken,
    finalized: Option<Message>,
}

impl StreamSession {
    pub fn new(
        conversation_id: impl Into<String>,
        images: ImageResolver,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(SessionState::Idle);
        Self {
            conversation_id: conversation_id.into(),
            state_tx,
            accumulator: Accumulator::new(images),
            reassembler: LineReassembler::new(),
            cancel,
            finalized: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_draft(&self) -> watch::Receiver<Draft> {
        self.accumulator.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the request to a terminal state and commit the reply to `sink`.
    pub async fn run(
        mut self,
        transport: &dyn StreamTransport,
        request: &ChatRequest,
        sink: &dyn MessageSink,
    ) -> SessionOutcome {
        self.transition(SessionState::Sending);
        let cancel = self.cancel.clone();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            r = transport.open(request) => r,
        };

        let end = match opened {
            Ok(stream) => {
                self.transition(SessionState::Streaming);
                self.pump(stream).await
            }
            Err(e) if e.is_cancellation() => StreamEnd::Cancelled,
            Err(e) => StreamEnd::Failed(e),
        };

        let state = self.settle(end);
        let message = self.finalize(sink);
        self.transition(state);
        info!(
            conversation_id = %self.conversation_id,
            state = %state,
            chars = message.content.len(),
            "stream session finished"
        );
        SessionOutcome {
            conversation_id: self.conversation_id,
            state,
            message,
        }
    }

    async fn pump(&mut self, mut stream: ByteStream) -> StreamEnd {
        let cancel = self.cancel.clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                item = stream.next() => item,
            };
            let chunk = match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(chunk)) => chunk,
            };
            for line in self.reassembler.feed(&chunk) {
                if let Some(event) = decode(&line) {
                    let terminal = event.is_terminal();
                    self.accumulator.apply(event);
                    if terminal {
                        return StreamEnd::Terminal;
                    }
                }
            }
        }
    }

    /// Map how the loop ended onto a terminal state and settle the draft.
    fn settle(&mut self, end: StreamEnd) -> SessionState {
        match end {
            StreamEnd::Terminal => match &self.accumulator.draft().status {
                DraftStatus::Errored(detail) => {
                    let e = ChatError::ServerSignalled(detail.clone());
                    warn!(conversation_id = %self.conversation_id, error = %e, kind = e.kind(), "backend signalled an error");
                    SessionState::Errored
                }
                _ => SessionState::Completed,
            },
            StreamEnd::Closed => {
                if let Some(tail) = self.reassembler.finish() {
                    warn!(
                        conversation_id = %self.conversation_id,
                        bytes = tail.bytes.len(),
                        record = %tail.lossy(),
                        "transport closed mid-record, treating as end of stream"
                    );
                }
                debug!(conversation_id = %self.conversation_id, "no done record, completing on close");
                self.accumulator.settle(DraftStatus::Completed);
                SessionState::Completed
            }
            StreamEnd::Failed(e) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    kind = e.kind(),
                    "stream session failed"
                );
                self.accumulator.settle(DraftStatus::Errored(e.to_string()));
                SessionState::Errored
            }
            StreamEnd::Cancelled => {
                debug!(conversation_id = %self.conversation_id, "stream session cancelled");
                self.accumulator.settle(DraftStatus::Interrupted);
                SessionState::Aborted
            }
        }
    }

    /// Commit the draft. Only the first call appends; later calls return the
    /// message already committed.
    pub fn finalize(&mut self, sink: &dyn MessageSink) -> Message {
        if let Some(done) = &self.finalized {
            return done.clone();
        }
        let message = self.accumulator.draft().clone().into_message();
        sink.append_message(&self.conversation_id, message.clone());
        self.finalized = Some(message.clone());
        message
    }

    fn transition(&self, next: SessionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            debug!(conversation_id = %self.conversation_id, from = %prev, to = %next, "session state");
        }
    }
}
