//! # Stage: Accumulator
//!
//! ## Responsibility
//! Fold decoded events into the draft assistant message and republish the
//! draft after every mutation so presentation sees partial output.
//!
//! ## Guarantees
//! - [`reduce`] is a pure `(draft, event) -> draft'` step with no transport,
//!   so it can be tested on its own.
//! - `content` and `reasoning` are append-only.
//! - `context` is last-write-wins (the server sends whole snapshots).
//! - Images are de-duplicated by resolved identity.
//! - Once a draft is terminal, further events are ignored.

use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::conversation::{local_id, ImageRef, Message, Role};
use crate::protocol::{ContextSnippet, ImageDescriptor, StreamEvent};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DraftStatus {
    #[default]
    Streaming,
    Completed,
    Errored(String),
    Interrupted,
}

impl DraftStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DraftStatus::Streaming)
    }
}

/// The in-progress assistant reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Draft {
    pub content: String,
    pub reasoning: String,
    pub context: Vec<ContextSnippet>,
    pub images: Vec<ImageRef>,
    pub status: DraftStatus,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the draft into the message the store keeps.
    pub fn into_message(self) -> Message {
        let (error, error_detail) = match &self.status {
            DraftStatus::Errored(detail) => (true, Some(detail.clone())),
            _ => (false, None),
        };
        Message {
            id: local_id(),
            role: Role::Assistant,
            content: self.content,
            reasoning_content: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            context: self.context,
            images: self.images,
            interrupted: self.status == DraftStatus::Interrupted,
            error,
            error_detail,
        }
    }
}

/// Turns image descriptors into displayable references.
#[derive(Debug, Clone)]
pub struct ImageResolver {
    base_url: String,
}

impl ImageResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    /// `None` when the descriptor carries neither a path nor inline data.
    pub fn resolve(&self, d: &ImageDescriptor) -> Option<ImageRef> {
        let label = d.tool_name.clone();
        if let Some(path) = d.url_path.as_deref().filter(|p| !p.is_empty()) {
            let url = if path.starts_with("http://") || path.starts_with("https://") {
                path.to_string()
            } else if path.starts_with('/') {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}/{}", self.base_url, path)
            };
            return Some(ImageRef {
                identity: url.clone(),
                url,
                label,
            });
        }
        let data = d.image_data.as_deref().filter(|s| !s.is_empty())?;
        let format = d.format.as_deref().unwrap_or("png");
        let hash_input = match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "inline image is not valid base64, hashing raw text");
                data.as_bytes().to_vec()
            }
        };
        Some(ImageRef {
            url: format!("data:image/{format};base64,{data}"),
            identity: format!("sha1:{}", hex(&Sha1::digest(&hash_input))),
            label,
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Apply one event. Returns `true` when the draft changed.
pub fn reduce(draft: &mut Draft, event: StreamEvent, images: &ImageResolver) -> bool {
    if draft.status.is_terminal() {
        debug!(kind = event.kind(), "event after terminal state ignored");
        return false;
    }
    match event {
        StreamEvent::Content(delta) => {
            if delta.is_empty() {
                return false;
            }
            draft.content.push_str(&delta);
        }
        StreamEvent::Reasoning(delta) => {
            if delta.is_empty() {
                return false;
            }
            draft.reasoning.push_str(&delta);
        }
        StreamEvent::Context(snapshot) => {
            draft.context = snapshot;
        }
        StreamEvent::Image(descriptor) => {
            let Some(image) = images.resolve(&descriptor) else {
                warn!("image event without url_path or image_data dropped");
                return false;
            };
            if draft.images.iter().any(|i| i.identity == image.identity) {
                debug!(identity = %image.identity, "duplicate image ignored");
                return false;
            }
            draft.images.push(image);
        }
        StreamEvent::Error(message) => {
            draft.status = DraftStatus::Errored(message);
        }
        StreamEvent::Done => {
            draft.status = DraftStatus::Completed;
        }
    }
    true
}

/// Owns the draft and a watch channel that republishes it on every change.
#[derive(Debug)]
pub struct Accumulator {
    draft: Draft,
    images: ImageResolver,
    tx: watch::Sender<Draft>,
}

impl Accumulator {
    pub fn new(images: ImageResolver) -> Self {
        let (tx, _rx) = watch::channel(Draft::new());
        Self {
            draft: Draft::new(),
            images,
            tx,
        }
    }

    /// A receiver that always sees the latest draft.
    pub fn subscribe(&self) -> watch::Receiver<Draft> {
        self.tx.subscribe()
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn apply(&mut self, event: StreamEvent) -> bool {
        let changed = reduce(&mut self.draft, event, &self.images);
        if changed {
            self.publish();
        }
        changed
    }

    /// Force a terminal status from outside the event stream (cancellation,
    /// transport failure, implicit completion). No-op if already terminal.
    pub fn settle(&mut self, status: DraftStatus) {
        if self.draft.status.is_terminal() {
            return;
        }
        self.draft.status = status;
        self.publish();
    }

    fn publish(&self) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(self.draft.clone());
    }
}
