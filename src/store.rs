//! # Stage: Conversation Store
//!
//! ## Responsibility
//! Single writer of every conversation's message list. Owns the live
//! [`StreamSession`] per conversation and publishes a [`StoreSnapshot`] that
//! presentation reads from.
//!
//! ## Guarantees
//! - At most one live session per conversation. A new send or regenerate
//!   cancels the prior session and waits for it to finalize before the new
//!   one is spawned.
//! - Message lists change only through [`MessageSink::append_message`]
//!   (session finalize), a submitted prompt, or a wholesale reload from the
//!   backend. Reloads never merge.
//! - A notification never reloads a conversation that has a live session,
//!   and never reloads on behalf of this client's own actions.
//!
//! ## NOT Responsible For
//! - Reconnecting the notification channel (see `channel`)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{Draft, ImageResolver};
use crate::backend::ConversationBackend;
use crate::conversation::{Conversation, ConversationSummary, Message, Role};
use crate::error::{ChatError, Result};
use crate::protocol::{Attachment, ChatRequest, NotificationEvent, WireMessage};
use crate::session::{MessageSink, SessionOutcome, SessionState, StreamSession, StreamTransport};

/// What presentation renders from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Conversation currently shown. `None` means a fresh conversation that
    /// the backend will create on first send.
    pub active: Option<String>,
    /// Loaded conversations by id.
    pub threads: HashMap<String, Conversation>,
    pub summaries: Vec<ConversationSummary>,
}

impl StoreSnapshot {
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.threads.get(id))
    }
}

/// Request fields that do not change from send to send.
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub model: String,
    pub system_prompt: String,
    pub client_id: String,
}

/// One user turn.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Prompt {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Caller's view of a spawned session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub conversation_id: String,
    pub draft: watch::Receiver<Draft>,
    pub state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Cancel locally. The partial reply is kept as an interrupted message.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the session is terminal. The reply is already in the
    /// store by then.
    pub async fn finished(&mut self) -> SessionState {
        if let Ok(state) = self.state.wait_for(|s| s.is_terminal()).await {
            return *state;
        }
        *self.state.borrow()
    }
}

struct LiveSession {
    id: u64,
    cancel: CancellationToken,
    join: JoinHandle<SessionOutcome>,
}

struct Inner {
    backend: Arc<dyn ConversationBackend>,
    transport: Arc<dyn StreamTransport>,
    images: ImageResolver,
    defaults: RequestDefaults,
    snapshot: watch::Sender<StoreSnapshot>,
    live: Mutex<HashMap<String, LiveSession>>,
    /// Serializes supersede-then-spawn so two sends cannot interleave.
    dispatch: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
}

/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Inner>,
}

impl ConversationStore {
    pub fn new(
        backend: Arc<dyn ConversationBackend>,
        transport: Arc<dyn StreamTransport>,
        images: ImageResolver,
        defaults: RequestDefaults,
    ) -> Self {
        let (snapshot, _rx) = watch::channel(StoreSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                backend,
                transport,
                images,
                defaults,
                snapshot,
                live: Mutex::new(HashMap::new()),
                dispatch: tokio::sync::Mutex::new(()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.defaults.client_id
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn active_id(&self) -> Option<String> {
        self.inner.snapshot.borrow().active.clone()
    }

    /// Whether a session for `conversation_id` is still running.
    pub fn is_live(&self, conversation_id: &str) -> bool {
        self.live()
            .get(conversation_id)
            .is_some_and(|s| !s.join.is_finished())
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveSession>> {
        self.inner.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Loading ------------------------------------------------------------

    /// Switch to a fresh conversation. The backend creates it on first send.
    pub fn start_conversation(&self) {
        self.inner.snapshot.send_if_modified(|s| s.active.take().is_some());
    }

    /// Replace the local message list of `conversation_id` with the
    /// backend's and make it active.
    pub async fn load_conversation(&self, conversation_id: &str) -> Result<()> {
        self.reload(conversation_id).await?;
        self.inner.snapshot.send_modify(|s| {
            s.active = Some(conversation_id.to_string());
        });
        Ok(())
    }

    async fn reload(&self, conversation_id: &str) -> Result<()> {
        let messages = self.inner.backend.get_conversation(conversation_id).await?;
        debug!(conversation_id, messages = messages.len(), "conversation reloaded");
        self.inner.snapshot.send_modify(|s| {
            let summary = s.summaries.iter().find(|c| c.id == conversation_id).cloned();
            let conv = s
                .threads
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id));
            conv.messages = messages;
            if let Some(summary) = summary {
                conv.title = summary.summary.unwrap_or_default();
                conv.created_at = summary.created_at;
            }
        });
        Ok(())
    }

    pub async fn refresh_list(&self) -> Result<()> {
        let summaries = self.inner.backend.list_conversations().await?;
        self.inner.snapshot.send_modify(|s| {
            for summary in &summaries {
                if let Some(conv) = s.threads.get_mut(&summary.id) {
                    conv.title = summary.summary.clone().unwrap_or_default();
                }
            }
            s.summaries = summaries;
        });
        Ok(())
    }

    /// Re-pull the conversation list and, unless it is streaming, the active
    /// conversation.
    pub async fn refresh(&self) -> Result<()> {
        self.refresh_list().await?;
        if let Some(active) = self.active_id() {
            if self.is_live(&active) {
                debug!(conversation_id = %active, "skipping reload of streaming conversation");
            } else {
                self.reload(&active).await?;
            }
        }
        Ok(())
    }

    // -- Generation ---------------------------------------------------------

    /// Submit a prompt to the active conversation, creating one first if
    /// none is active.
    pub async fn send(&self, prompt: Prompt) -> Result<SessionHandle> {
        let conversation_id = match self.active_id() {
            Some(id) => id,
            None => self.create_and_activate().await?,
        };

        let _dispatch = self.inner.dispatch.lock().await;
        self.supersede(&conversation_id).await;

        let user = Message::user(prompt.text.clone());
        let mut history = Vec::new();
        self.inner.snapshot.send_modify(|s| {
            let conv = s
                .threads
                .entry(conversation_id.clone())
                .or_insert_with(|| Conversation::new(conversation_id.clone()));
            history = conv.wire_history();
            conv.messages.push(user);
        });

        let request = self.request(Some(conversation_id.clone()), history, prompt, None);
        Ok(self.spawn_session(conversation_id, request))
    }

    /// Re-generate the assistant reply `message_id`. That message and every
    /// later one are dropped locally before the new session starts.
    pub async fn regenerate(&self, conversation_id: &str, message_id: &str) -> Result<SessionHandle> {
        let _dispatch = self.inner.dispatch.lock().await;
        self.supersede(conversation_id).await;

        let mut found: Option<(Vec<WireMessage>, String)> = None;
        self.inner.snapshot.send_if_modified(|s| {
            let Some(conv) = s.threads.get_mut(conversation_id) else {
                return false;
            };
            let Some(pos) = conv.position_of(message_id) else {
                return false;
            };
            if conv.messages[pos].role != Role::Assistant {
                return false;
            }
            let Some(user_pos) = conv.messages[..pos].iter().rposition(|m| m.role == Role::User)
            else {
                return false;
            };
            found = Some((
                conv.wire_history_until(user_pos),
                conv.messages[user_pos].content.clone(),
            ));
            conv.messages.truncate(pos);
            true
        });

        let (history, text) = found.ok_or_else(|| {
            ChatError::NotFound(format!(
                "assistant message {message_id} with a preceding prompt in {conversation_id}"
            ))
        })?;
        let request = self.request(
            Some(conversation_id.to_string()),
            history,
            Prompt::new(text),
            Some(message_id.to_string()),
        );
        Ok(self.spawn_session(conversation_id.to_string(), request))
    }

    /// Cancel the live session of `conversation_id`, if any.
    pub fn stop(&self, conversation_id: &str) -> bool {
        match self.live().get(conversation_id) {
            Some(live) => {
                live.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn request(
        &self,
        conversation_id: Option<String>,
        messages: Vec<WireMessage>,
        prompt: Prompt,
        regenerate_message_id: Option<String>,
    ) -> ChatRequest {
        let d = &self.inner.defaults;
        ChatRequest {
            conversation_id,
            model: prompt.model.unwrap_or_else(|| d.model.clone()),
            system_prompt: prompt.system_prompt.unwrap_or_else(|| d.system_prompt.clone()),
            client_id: d.client_id.clone(),
            messages,
            message: prompt.text,
            attachments: prompt.attachments,
            regenerate_message_id,
        }
    }

    async fn create_and_activate(&self) -> Result<String> {
        let id = self.inner.backend.create_conversation().await?;
        info!(conversation_id = %id, "created conversation");
        self.inner.snapshot.send_modify(|s| {
            s.threads
                .entry(id.clone())
                .or_insert_with(|| Conversation::new(id.clone()));
            s.active = Some(id.clone());
        });
        Ok(id)
    }

    /// Cancel the prior session for `conversation_id` and wait until it has
    /// finalized.
    async fn supersede(&self, conversation_id: &str) {
        let prior = self.live().remove(conversation_id);
        let Some(prior) = prior else { return };
        prior.cancel.cancel();
        match prior.join.await {
            Ok(outcome) => debug!(
                conversation_id,
                session = prior.id,
                state = %outcome.state,
                "prior session superseded"
            ),
            Err(e) => warn!(conversation_id, error = %e, "prior session task failed"),
        }
    }

    fn spawn_session(&self, conversation_id: String, request: ChatRequest) -> SessionHandle {
        let cancel = CancellationToken::new();
        let session = StreamSession::new(
            conversation_id.clone(),
            self.inner.images.clone(),
            cancel.clone(),
        );
        let handle = SessionHandle {
            conversation_id: conversation_id.clone(),
            draft: session.subscribe_draft(),
            state: session.subscribe_state(),
            cancel: cancel.clone(),
        };

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let store = self.clone();
        let transport = Arc::clone(&self.inner.transport);
        let conv = conversation_id.clone();
        let join = tokio::spawn(async move {
            let outcome = session.run(transport.as_ref(), &request, &store).await;
            store.retire(&conv, id);
            outcome
        });
        debug!(conversation_id = %conversation_id, session = id, "session spawned");
        self.live().insert(conversation_id, LiveSession { id, cancel, join });
        handle
    }

    fn retire(&self, conversation_id: &str, id: u64) {
        let mut live = self.live();
        if live.get(conversation_id).is_some_and(|s| s.id == id) {
            live.remove(conversation_id);
        }
    }

    // -- Pass-throughs ------------------------------------------------------

    /// Delete on the backend, then drop local state. A live session for the
    /// conversation is cancelled first.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        {
            let _dispatch = self.inner.dispatch.lock().await;
            self.supersede(conversation_id).await;
        }
        self.inner.backend.delete_conversation(conversation_id).await?;
        self.forget(conversation_id);
        self.refresh_list().await
    }

    /// Edit on the backend, then reload the conversation from it.
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<()> {
        self.inner.backend.edit_message(message_id, content).await?;
        if self.is_live(conversation_id) {
            return Ok(());
        }
        self.reload(conversation_id).await
    }

    fn forget(&self, conversation_id: &str) {
        self.inner.snapshot.send_if_modified(|s| {
            let removed = s.threads.remove(conversation_id).is_some();
            let was_active = s.active.as_deref() == Some(conversation_id);
            if was_active {
                s.active = None;
            }
            removed || was_active
        });
    }

    // -- Notifications ------------------------------------------------------

    /// React to a pushed change signal by re-pulling the affected scope.
    /// Returns the id of the conversation that was reloaded, if any.
    pub async fn handle_notification(&self, event: &NotificationEvent) -> Result<Option<String>> {
        self.refresh_list().await?;

        let target = match event {
            NotificationEvent::ConversationCreated { .. }
            | NotificationEvent::SummaryUpdated { .. } => return Ok(None),
            NotificationEvent::ConversationDeleted { conversation_id, .. } => {
                // The cancelled session must finalize before the thread is
                // dropped, or its append would recreate it.
                {
                    let _dispatch = self.inner.dispatch.lock().await;
                    if self.is_live(conversation_id) {
                        info!(conversation_id = %conversation_id, "conversation deleted elsewhere, stopping generation");
                    }
                    self.supersede(conversation_id).await;
                    self.forget(conversation_id);
                }
                return Ok(None);
            }
            NotificationEvent::MessageAdded { .. } | NotificationEvent::MessageEdited { .. } => {
                match event.conversation_id().map(str::to_string).or_else(|| self.active_id()) {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
        };

        if event.origin() == Some(self.client_id()) {
            debug!(conversation_id = %target, "own notification, already applied locally");
            return Ok(None);
        }
        if self.is_live(&target) {
            debug!(conversation_id = %target, "notification for streaming conversation, not reloading");
            return Ok(None);
        }
        if !self.inner.snapshot.borrow().threads.contains_key(&target) {
            return Ok(None);
        }
        self.reload(&target).await?;
        Ok(Some(target))
    }
}

impl MessageSink for ConversationStore {
    fn append_message(&self, conversation_id: &str, message: Message) {
        self.inner.snapshot.send_modify(|s| {
            s.threads
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id))
                .messages
                .push(message);
        });
    }
}
