//! One open conversation: REST calls, the realtime pump and the local
//! message and proposal state behind them.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ConversationApi, CreateProposalRequest, RespondRequest};
use crate::auth::{require_session, AuthSession, SessionProvider};
use crate::bus::{EventBus, NotificationLevel, SessionEvent};
use crate::chat::{ChatInfo, ChatMessage, MessageDraft};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::message_store::{Confirmation, MessageStore};
use crate::presence::{Presence, PresenceTracker};
use crate::proposal::{
    Proposal, ProposalDraft, ProposalEvent, ProposalManager, Resolution, ResponseAction,
};
use crate::realtime::{ChannelEvent, RealtimeProvider, SubscribeRequest, Subscription};
use crate::scroll::ScrollFollow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Reconnecting { attempt: u32 },
    Closed,
}

impl ConnectionState {
    /// `connecting -> subscribed -> {reconnecting -> subscribed}* -> closed`
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Subscribed) => true,
            (Subscribed, Reconnecting { .. }) => true,
            (Reconnecting { .. }, Reconnecting { .. }) => true,
            (Reconnecting { .. }, Subscribed) => true,
            _ => false,
        }
    }
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn ConversationApi>,
    pub auth: Arc<dyn SessionProvider>,
    pub realtime: Arc<dyn RealtimeProvider>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
}

struct SessionState {
    connection: ConnectionState,
    info: Option<ChatInfo>,
    messages: MessageStore,
    presence: PresenceTracker,
    proposals: ProposalManager,
    scroll: ScrollFollow,
    draft: String,
}

impl SessionState {
    /// Mirror channel membership onto the counterpart entries of `info`.
    fn sync_participants(&mut self, user_id: &str) {
        let Some(info) = self.info.as_mut() else {
            return;
        };
        for participant in info.participants.iter_mut().filter(|p| p.id != user_id) {
            participant.online = self.presence.is_member(&participant.id);
        }
    }
}

struct Inner {
    chat_id: String,
    user_id: String,
    config: Config,
    deps: SessionDeps,
    state: Mutex<SessionState>,
    closed: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Resolves once the session is closed or its owner is gone.
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.lock();
        f(&mut state)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::InvalidState("this chat session is closed".to_string()));
        }
        Ok(())
    }

    async fn session(&self) -> Result<AuthSession> {
        match require_session(self.deps.auth.as_ref(), self.deps.clock.now()).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.deps.bus.publish(SessionEvent::AuthRequired);
                Err(e)
            }
        }
    }

    /// Run a remote call bounded by the request timeout. A close in the
    /// meantime abandons the call and its result.
    async fn call<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut closed = self.closed.subscribe();
        let timeout = self.config.request_timeout;
        let result = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(SessionError::InvalidState(format!(
                "chat session closed during {}",
                what
            ))),
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(SessionError::network(format!(
                    "{} timed out after {}s",
                    what,
                    timeout.as_secs_f32()
                ))),
            },
        };
        if let Err(e) = &result {
            if e.escalates() {
                self.deps.bus.publish(SessionEvent::AuthRequired);
            }
        }
        result
    }

    fn report(&self, error: &SessionError) {
        if error.escalates() {
            return;
        }
        self.deps.bus.publish(SessionEvent::Notification {
            level: NotificationLevel::Error,
            message: error.user_message(),
            chat_id: Some(self.chat_id.clone()),
        });
    }

    fn set_connection(&self, next: ConnectionState) -> bool {
        let moved = self.with_state(|s| {
            if s.connection.can_transition(next) {
                s.connection = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!("Chat {} connection is now {:?}", self.chat_id, next);
            self.deps.bus.publish(SessionEvent::ConnectionChanged {
                chat_id: self.chat_id.clone(),
                state: next,
            });
        }
        moved
    }

    fn shutdown(&self) {
        self.set_connection(ConnectionState::Closed);
        self.closed.send_replace(true);
    }

    fn messages_changed(&self) {
        let len = self.with_state(|s| s.messages.len());
        self.deps.bus.publish(SessionEvent::MessagesChanged {
            chat_id: self.chat_id.clone(),
            len,
        });
    }

    fn proposals_changed(&self) {
        let now = self.deps.clock.now();
        let active = self.with_state(|s| s.proposals.active_proposal(now).map(|p| p.id.clone()));
        self.deps.bus.publish(SessionEvent::ProposalsChanged {
            chat_id: self.chat_id.clone(),
            active,
        });
    }

    /// Apply proposal traffic found in message metadata.
    fn route_proposal(state: &mut SessionState, message: &ChatMessage) -> bool {
        match ProposalEvent::from_message(message) {
            Some(ProposalEvent::Created(proposal)) => state.proposals.upsert_remote(proposal),
            Some(ProposalEvent::Responded {
                proposal_id,
                action,
                counter,
            }) => state.proposals.apply_remote_response(&proposal_id, action, counter),
            None => false,
        }
    }

    /// Ingest history through the de-duplicating path. Returns how many
    /// messages were new and whether proposals changed.
    fn ingest_history(&self, history: Vec<ChatMessage>) -> (usize, bool) {
        self.with_state(|s| {
            let mut proposals_changed = false;
            for message in &history {
                proposals_changed |= Self::route_proposal(s, message);
            }
            (s.messages.load_history(history), proposals_changed)
        })
    }

    fn on_insert(&self, message: ChatMessage) {
        if message.chat_id.as_deref().map_or(false, |id| id != self.chat_id) {
            debug!("Ignoring message {} for another chat", message.id);
            return;
        }
        let from_self = message.is_from(&self.user_id);
        let id = message.id.clone();
        let (inserted, proposals_changed) = self.with_state(|s| {
            let proposals_changed = Self::route_proposal(s, &message);
            let inserted = s.messages.ingest_remote(message);
            if inserted {
                s.scroll.on_message(from_self);
            }
            (inserted, proposals_changed)
        });
        if inserted {
            self.messages_changed();
        } else {
            debug!("Dropped duplicate delivery of {} in chat {}", id, self.chat_id);
        }
        if proposals_changed {
            self.proposals_changed();
        }
    }

    fn on_presence(&self, keys: Vec<String>) {
        let (before, after) = self.with_state(|s| {
            let before = s.presence.state();
            s.presence.on_sync(keys);
            s.sync_participants(&self.user_id);
            (before, s.presence.state())
        });
        if before != after {
            info!("Counterpart in chat {} is {:?}", self.chat_id, after);
            self.deps.bus.publish(SessionEvent::PresenceChanged {
                chat_id: self.chat_id.clone(),
                presence: after,
            });
        }
    }

    fn on_channel_lost(&self, reason: &str) {
        warn!("Realtime channel for chat {} lost: {}", self.chat_id, reason);
        let before = self.with_state(|s| {
            let before = s.presence.state();
            s.presence.reset();
            s.sync_participants(&self.user_id);
            before
        });
        if before != Presence::Unknown {
            self.deps.bus.publish(SessionEvent::PresenceChanged {
                chat_id: self.chat_id.clone(),
                presence: Presence::Unknown,
            });
        }
    }

    /// Subscribe and, once the channel is confirmed, announce presence.
    async fn subscribe_channel(&self) -> Result<Subscription> {
        let auth = self.session().await?;
        let request = SubscribeRequest {
            chat_id: self.chat_id.clone(),
            presence_key: self.user_id.clone(),
            access_token: auth.access_token,
        };
        let subscription = self
            .call("realtime subscribe", self.deps.realtime.subscribe(&request))
            .await?;
        subscription.track(&self.user_id)?;
        Ok(subscription)
    }

    async fn refetch_history(&self) {
        let auth = match self.session().await {
            Ok(auth) => auth,
            Err(_) => return,
        };
        match self
            .call("history refetch", self.deps.api.messages(&auth.access_token, &self.chat_id))
            .await
        {
            Ok(history) => {
                let (added, proposals_changed) = self.ingest_history(history);
                info!("Gap fill for chat {} added {} messages", self.chat_id, added);
                if added > 0 {
                    self.messages_changed();
                }
                if proposals_changed {
                    self.proposals_changed();
                }
            }
            Err(e) => warn!("Gap fill for chat {} failed: {}", self.chat_id, e),
        }
    }
}

/// Re-subscribe with exponential backoff until it works, the session closes
/// or auth is lost.
async fn reconnect(
    weak: &Weak<Inner>,
    closed: &mut watch::Receiver<bool>,
    reason: &str,
) -> Option<Subscription> {
    weak.upgrade()?.on_channel_lost(reason);

    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let delay = {
            let inner = weak.upgrade()?;
            if !inner.set_connection(ConnectionState::Reconnecting { attempt }) {
                return None;
            }
            inner.config.reconnect_delay(attempt)
        };
        info!("Reconnect attempt {} in {:?}", attempt, delay);

        tokio::select! {
            biased;
            _ = wait_closed(closed) => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let inner = weak.upgrade()?;
        match inner.subscribe_channel().await {
            Ok(subscription) => {
                if !inner.set_connection(ConnectionState::Subscribed) {
                    return None;
                }
                info!("Chat {} resubscribed after {} attempts", inner.chat_id, attempt);
                if inner.config.refetch_on_reconnect {
                    inner.refetch_history().await;
                }
                return Some(subscription);
            }
            Err(e) if e.escalates() => {
                error!("Giving up on chat {}: {}", inner.chat_id, e);
                inner.shutdown();
                return None;
            }
            Err(e) => {
                warn!("Reconnect attempt {} for chat {} failed: {}", attempt, inner.chat_id, e);
                if attempt == inner.config.reconnect_max_attempts {
                    inner.deps.bus.publish(SessionEvent::Notification {
                        level: NotificationLevel::Warning,
                        message: "Connection lost, still trying to reconnect".to_string(),
                        chat_id: Some(inner.chat_id.clone()),
                    });
                }
            }
        }
    }
}

/// Drains the realtime subscription. Holds the session weakly so dropping
/// every controller handle ends the task and releases the channel.
async fn pump(
    weak: Weak<Inner>,
    mut subscription: Subscription,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            event = subscription.next_event() => event,
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            Some(ChannelEvent::InsertMessage(message)) => inner.on_insert(message),
            Some(ChannelEvent::PresenceSync(keys)) => inner.on_presence(keys),
            Some(ChannelEvent::Closed { reason }) => {
                drop(inner);
                match reconnect(&weak, &mut closed, &reason).await {
                    Some(next) => subscription = next,
                    None => return,
                }
            }
            None => {
                drop(inner);
                match reconnect(&weak, &mut closed, "realtime stream ended").await {
                    Some(next) => subscription = next,
                    None => return,
                }
            }
        }
    }
    debug!("Pump for chat {} stopping", subscription.chat_id());
    subscription.unsubscribe();
}

/// Handle to an open chat session. Clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Resolve auth, load the conversation, subscribe and start the pump.
    pub async fn open(
        chat_id: impl Into<String>,
        config: Config,
        deps: SessionDeps,
    ) -> Result<Self> {
        let chat_id = chat_id.into();
        let auth = match require_session(deps.auth.as_ref(), deps.clock.now()).await {
            Ok(auth) => auth,
            Err(e) => {
                deps.bus.publish(SessionEvent::AuthRequired);
                return Err(e);
            }
        };
        info!("Opening chat {} for user {}", chat_id, auth.user_id);

        let (closed, _) = watch::channel(false);
        let proposals = ProposalManager::new(config.proposal_ttl);
        let inner = Arc::new(Inner {
            chat_id,
            user_id: auth.user_id.clone(),
            config,
            deps,
            state: Mutex::new(SessionState {
                connection: ConnectionState::Connecting,
                info: None,
                messages: MessageStore::new(),
                presence: PresenceTracker::new(),
                proposals,
                scroll: ScrollFollow::default(),
                draft: String::new(),
            }),
            closed,
            pump: Mutex::new(None),
        });

        match Self::load_and_subscribe(&inner, &auth).await {
            Ok(subscription) => {
                inner.set_connection(ConnectionState::Subscribed);
                let handle = tokio::spawn(pump(
                    Arc::downgrade(&inner),
                    subscription,
                    inner.closed.subscribe(),
                ));
                *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                info!("Chat {} is live", inner.chat_id);
                Ok(Self { inner })
            }
            Err(e) => {
                warn!("Opening chat {} failed: {}", inner.chat_id, e);
                inner.shutdown();
                Err(e)
            }
        }
    }

    async fn load_and_subscribe(inner: &Inner, auth: &AuthSession) -> Result<Subscription> {
        let token = auth.access_token.as_str();
        let info = inner
            .call("chat info", inner.deps.api.chat_info(token, &inner.chat_id))
            .await?;
        let history = inner
            .call("chat history", inner.deps.api.messages(token, &inner.chat_id))
            .await?;

        let seeded = info.proposals.clone();
        inner.with_state(|s| {
            for proposal in seeded {
                s.proposals.upsert_remote(proposal);
            }
            s.info = Some(info);
        });
        let (loaded, _) = inner.ingest_history(history);
        debug!("Loaded {} messages for chat {}", loaded, inner.chat_id);
        inner.messages_changed();
        inner.proposals_changed();

        let max_attempts = inner.config.reconnect_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match inner.subscribe_channel().await {
                Ok(subscription) => return Ok(subscription),
                Err(e) if e.escalates() || attempt >= max_attempts => return Err(e),
                Err(e) => {
                    warn!("Subscribe attempt {} for chat {} failed: {}", attempt, inner.chat_id, e);
                    let delay = inner.config.reconnect_delay(attempt);
                    let mut closed = inner.closed.subscribe();
                    tokio::select! {
                        biased;
                        _ = wait_closed(&mut closed) => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.inner.chat_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.with_state(|s| s.connection)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn presence(&self) -> Presence {
        self.inner.with_state(|s| s.presence.state())
    }

    pub fn is_counterpart_online(&self) -> bool {
        self.inner.with_state(|s| s.presence.is_online())
    }

    pub fn info(&self) -> Option<ChatInfo> {
        self.inner.with_state(|s| s.info.clone())
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.with_state(|s| s.messages.snapshot())
    }

    pub fn last_message(&self) -> Option<ChatMessage> {
        self.inner.with_state(|s| s.messages.last().cloned())
    }

    pub fn message_count(&self) -> usize {
        self.inner.with_state(|s| s.messages.len())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.with_state(|s| s.messages.pending_count())
    }

    pub fn unread_count(&self) -> usize {
        let user_id = self.inner.user_id.clone();
        self.inner.with_state(|s| s.messages.unread_count(&user_id))
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        self.inner.with_state(|s| s.proposals.iter().cloned().collect())
    }

    pub fn proposal(&self, proposal_id: &str) -> Option<Proposal> {
        self.inner.with_state(|s| s.proposals.get(proposal_id).cloned())
    }

    /// The newest proposal that can still be answered.
    pub fn active_proposal(&self) -> Option<Proposal> {
        let now = self.inner.deps.clock.now();
        self.inner.with_state(|s| s.proposals.active_proposal(now).cloned())
    }

    /// Text sitting in the input box.
    pub fn draft(&self) -> String {
        self.inner.with_state(|s| s.draft.clone())
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        let text = text.into();
        self.inner.with_state(|s| s.draft = text);
    }

    pub fn scroll_follow(&self) -> ScrollFollow {
        self.inner.with_state(|s| s.scroll)
    }

    pub fn on_user_scroll(&self, at_bottom: bool) {
        self.inner.with_state(|s| s.scroll.on_user_scroll(at_bottom));
    }

    /// Optimistic send: the placeholder shows at once and is reconciled
    /// with the server record, or removed with the draft restored.
    pub async fn send(&self, draft: MessageDraft) -> Result<ChatMessage> {
        let inner = &self.inner;
        inner.ensure_open()?;
        draft.validate()?;
        let auth = inner.session().await?;

        let now = inner.deps.clock.now();
        let local_id = inner.with_state(|s| {
            let id = s.messages.append_optimistic(&draft, &inner.user_id, now);
            s.scroll.on_message(true);
            s.draft.clear();
            id
        });
        inner.messages_changed();

        let request = draft.clone().into_request();
        let result = inner
            .call(
                "send message",
                inner.deps.api.send_message(&auth.access_token, &inner.chat_id, &request),
            )
            .await;

        match result {
            Ok(message) => {
                let outcome = inner.with_state(|s| s.messages.confirm(&local_id, message.clone()));
                if outcome == Confirmation::MergedEcho {
                    debug!("Echo of {} arrived before its confirmation", message.id);
                }
                inner.messages_changed();
                Ok(message)
            }
            Err(e) if inner.is_closed() => {
                debug!("Send of {} abandoned, chat {} closed", local_id, inner.chat_id);
                Err(e)
            }
            Err(e) => {
                warn!("Send in chat {} failed, rolling back {}: {}", inner.chat_id, local_id, e);
                let content = draft.content;
                let restored = inner.with_state(|s| {
                    let removed = s.messages.rollback(&local_id).is_some();
                    if removed {
                        s.draft = content.clone();
                    }
                    removed
                });
                if restored {
                    inner.messages_changed();
                    inner.deps.bus.publish(SessionEvent::DraftRestored {
                        chat_id: inner.chat_id.clone(),
                        content,
                    });
                }
                inner.report(&e);
                Err(e)
            }
        }
    }

    pub async fn send_text(&self, content: impl Into<String>) -> Result<ChatMessage> {
        self.send(MessageDraft::text(content)).await
    }

    /// Upload the image, then send a message carrying its URL.
    pub async fn send_image(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
        caption: impl Into<String>,
    ) -> Result<ChatMessage> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let caption = caption.into();
        if bytes.is_empty() {
            return Err(SessionError::Validation("image is empty".to_string()));
        }
        let auth = inner.session().await?;
        let uploaded = inner
            .call(
                "image upload",
                inner
                    .deps
                    .api
                    .upload_image(&auth.access_token, file_name, content_type, bytes),
            )
            .await;
        match uploaded {
            Ok(image) => self.send(MessageDraft::image(image.url, caption)).await,
            Err(e) if inner.is_closed() => {
                debug!("Image upload abandoned, chat {} closed", inner.chat_id);
                Err(e)
            }
            Err(e) => {
                warn!("Image upload for chat {} failed: {}", inner.chat_id, e);
                if !caption.is_empty() {
                    inner.with_state(|s| s.draft = caption.clone());
                    inner.deps.bus.publish(SessionEvent::DraftRestored {
                        chat_id: inner.chat_id.clone(),
                        content: caption,
                    });
                }
                inner.report(&e);
                Err(e)
            }
        }
    }

    pub async fn send_location(
        &self,
        lat: f64,
        lng: f64,
        label: impl Into<String>,
    ) -> Result<ChatMessage> {
        self.send(MessageDraft::location(lat, lng, label)).await
    }

    /// Post a new proposal and track the server record.
    pub async fn propose(&self, draft: ProposalDraft) -> Result<Proposal> {
        let inner = &self.inner;
        inner.ensure_open()?;
        draft.validate()?;
        let auth = inner.session().await?;

        let now = inner.deps.clock.now();
        let expires_at = inner.with_state(|s| s.proposals.default_expiry(now));
        let request = CreateProposalRequest::from_draft(&draft, expires_at);
        let proposal = match inner
            .call(
                "create proposal",
                inner.deps.api.create_proposal(&auth.access_token, &inner.chat_id, &request),
            )
            .await
        {
            Ok(proposal) => proposal,
            Err(e) => {
                if !inner.is_closed() {
                    inner.report(&e);
                }
                return Err(e);
            }
        };
        info!("Proposal {} opened in chat {}", proposal.id, inner.chat_id);
        inner.with_state(|s| s.proposals.upsert_remote(proposal.clone()));
        inner.proposals_changed();
        Ok(proposal)
    }

    /// Accept, reject or counter. Only one response per proposal can be in
    /// flight; a second one fails with `InvalidState`.
    pub async fn respond(
        &self,
        proposal_id: &str,
        action: ResponseAction,
        counter: Option<ProposalDraft>,
        comment: Option<String>,
    ) -> Result<Resolution> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let now = inner.deps.clock.now();
        let counter_draft = match (action, counter) {
            (ResponseAction::Counter, Some(draft)) => {
                draft.validate()?;
                Some(draft)
            }
            (ResponseAction::Counter, None) => {
                return Err(SessionError::Validation("a counter needs a new offer".to_string()))
            }
            _ => None,
        };
        let auth = inner.session().await?;

        let ticket = inner.with_state(|s| s.proposals.begin_response(proposal_id, action, now))?;
        let counter = counter_draft.as_ref().map(|draft| {
            let expires_at = inner.with_state(|s| s.proposals.default_expiry(now));
            CreateProposalRequest::from_draft(draft, expires_at)
        });
        let request = RespondRequest {
            action,
            comment,
            counter,
        };
        let outcome = inner
            .call(
                "respond to proposal",
                inner
                    .deps
                    .api
                    .respond_proposal(&auth.access_token, &inner.chat_id, proposal_id, &request),
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                inner.with_state(|s| s.proposals.cancel_response(ticket));
                if inner.is_closed() {
                    debug!("Response to {} abandoned, chat {} closed", proposal_id, inner.chat_id);
                    return Err(e);
                }
                warn!("Responding to {} in chat {} failed: {}", proposal_id, inner.chat_id, e);
                inner.report(&e);
                return Err(e);
            }
        };

        let user_id = &inner.user_id;
        let resolution = inner.with_state(|s| {
            let counter = match (outcome.counter_proposal, counter_draft) {
                (Some(server), _) => Some(server),
                (None, Some(draft)) => {
                    debug!("No counter record for {}, recording it locally", proposal_id);
                    Some(s.proposals.local_counter(proposal_id, draft, user_id, now))
                }
                (None, None) => None,
            };
            let resolution = s.proposals.complete_response(ticket, counter)?;
            s.proposals.upsert_remote(outcome.proposal);
            Ok::<_, SessionError>(resolution)
        })?;
        info!("Proposal {} in chat {}: {}", proposal_id, inner.chat_id, action);
        inner
            .deps
            .bus
            .publish(SessionEvent::resolution_notice(&inner.chat_id, &resolution));
        inner.proposals_changed();
        Ok(resolution)
    }

    /// Mark one message read locally. Returns true if it changed.
    pub fn mark_read(&self, message_id: &str) -> bool {
        let changed = self.inner.with_state(|s| s.messages.mark_read(message_id));
        if changed {
            self.inner.messages_changed();
        }
        changed
    }

    /// Mark everything from the counterpart read; returns the ids flipped.
    pub fn mark_all_read(&self) -> Vec<String> {
        let user_id = self.inner.user_id.clone();
        let flipped = self.inner.with_state(|s| s.messages.mark_all_read(&user_id));
        if !flipped.is_empty() {
            self.inner.messages_changed();
        }
        flipped
    }

    /// Stop the pump and release the realtime channel. Idempotent.
    pub async fn close(&self) {
        let pump_running = || self.inner.pump.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        if self.inner.is_closed() && !pump_running() {
            return;
        }
        info!("Closing chat {}", self.inner.chat_id);
        self.inner.shutdown();
        let handle = self.inner.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Pump for chat {} ended badly: {}", self.inner.chat_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RespondOutcome, UploadedImage};
    use crate::auth::StaticSessionProvider;
    use crate::chat::{MessageKind, SendMessageRequest};
    use crate::clock::ManualClock;
    use crate::proposal::{ProposalKind, ProposalState};
    use crate::realtime::LocalHub;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeApi {
        history: Vec<ChatMessage>,
        proposals: Vec<Proposal>,
        fail_sends: bool,
        sent: AtomicUsize,
    }

    fn message(id: &str, sender: &str, content: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            chat_id: Some("c1".into()),
            sender_id: sender.into(),
            content: content.into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            read: false,
            kind: MessageKind::Text,
            image_url: None,
            metadata: None,
        }
    }

    fn pending(id: &str) -> Proposal {
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        Proposal {
            id: id.into(),
            author_id: "bob".into(),
            kind: ProposalKind::Price,
            description: "20 for the lamp".into(),
            proposed_price: Some(20.0),
            proposed_meetup_time: None,
            proposed_location: None,
            state: ProposalState::Pending,
            created_at,
            expires_at: created_at + Duration::hours(48),
            parent_id: None,
        }
    }

    #[async_trait]
    impl ConversationApi for FakeApi {
        async fn chat_info(&self, _token: &str, chat_id: &str) -> Result<ChatInfo> {
            Ok(ChatInfo {
                id: chat_id.into(),
                participants: Vec::new(),
                offered_product: None,
                requested_product: None,
                proposals: self.proposals.clone(),
            })
        }

        async fn messages(&self, _token: &str, _chat_id: &str) -> Result<Vec<ChatMessage>> {
            Ok(self.history.clone())
        }

        async fn send_message(
            &self,
            _token: &str,
            _chat_id: &str,
            request: &SendMessageRequest,
        ) -> Result<ChatMessage> {
            if self.fail_sends {
                return Err(SessionError::network("offline"));
            }
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(message(&format!("srv-{}", n), "me", &request.content))
        }

        async fn create_proposal(
            &self,
            _token: &str,
            _chat_id: &str,
            request: &CreateProposalRequest,
        ) -> Result<Proposal> {
            let mut proposal = pending("p-new");
            proposal.author_id = "me".into();
            proposal.description = request.description.clone();
            Ok(proposal)
        }

        async fn respond_proposal(
            &self,
            _token: &str,
            _chat_id: &str,
            proposal_id: &str,
            request: &RespondRequest,
        ) -> Result<RespondOutcome> {
            let mut proposal = pending(proposal_id);
            proposal.state = match request.action {
                ResponseAction::Accept => ProposalState::Accepted,
                ResponseAction::Reject => ProposalState::Rejected,
                ResponseAction::Counter => ProposalState::Countered,
            };
            let counter_proposal = request.counter.as_ref().map(|c| {
                let mut counter = pending("p-counter");
                counter.author_id = "me".into();
                counter.description = c.description.clone();
                counter.parent_id = Some(proposal_id.to_string());
                counter
            });
            Ok(RespondOutcome {
                proposal,
                counter_proposal,
            })
        }

        async fn upload_image(
            &self,
            _token: &str,
            file_name: &str,
            _content_type: &str,
            _bytes: Vec<u8>,
        ) -> Result<UploadedImage> {
            Ok(UploadedImage {
                url: format!("https://cdn.ecoswap.test/{}", file_name),
            })
        }
    }

    fn deps(api: FakeApi, hub: &LocalHub) -> SessionDeps {
        SessionDeps {
            api: Arc::new(api),
            auth: Arc::new(StaticSessionProvider::new(AuthSession::new("token", "me"))),
            realtime: Arc::new(hub.clone()),
            bus: Arc::new(EventBus::new()),
            clock: Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())),
        }
    }

    #[test]
    fn connection_state_machine() {
        use ConnectionState::*;
        assert!(Connecting.can_transition(Subscribed));
        assert!(Subscribed.can_transition(Reconnecting { attempt: 1 }));
        assert!(Reconnecting { attempt: 2 }.can_transition(Subscribed));
        assert!(Subscribed.can_transition(Closed));
        assert!(!Connecting.can_transition(Reconnecting { attempt: 1 }));
        assert!(!Closed.can_transition(Subscribed));
        assert!(!Subscribed.can_transition(Connecting));
    }

    #[tokio::test]
    async fn open_seeds_history_and_proposals() {
        let hub = LocalHub::new();
        let api = FakeApi {
            history: vec![message("m1", "bob", "hi"), message("m2", "me", "hey")],
            proposals: vec![pending("p1")],
            ..Default::default()
        };
        let session = SessionController::open("c1", Config::default(), deps(api, &hub))
            .await
            .unwrap();

        assert_eq!(session.connection_state(), ConnectionState::Subscribed);
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.unread_count(), 1);
        assert_eq!(session.active_proposal().map(|p| p.id), Some("p1".to_string()));
        assert_eq!(hub.presence("c1"), vec!["me".to_string()]);
        session.close().await;
    }

    #[tokio::test]
    async fn signed_out_open_is_auth_error() {
        let hub = LocalHub::new();
        let mut deps = deps(FakeApi::default(), &hub);
        deps.auth = Arc::new(StaticSessionProvider::signed_out());
        let mut events = deps.bus.subscribe();

        let result = SessionController::open("c1", Config::default(), deps).await;
        assert!(matches!(result, Err(SessionError::Auth(_))));
        assert!(matches!(events.recv().await, Ok(SessionEvent::AuthRequired)));
        assert_eq!(hub.subscriber_count("c1"), 0);
    }

    #[tokio::test]
    async fn failed_send_restores_draft() {
        let hub = LocalHub::new();
        let api = FakeApi {
            fail_sends: true,
            ..Default::default()
        };
        let session = SessionController::open("c1", Config::default(), deps(api, &hub))
            .await
            .unwrap();

        let err = session.send_text("Hola").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.message_count(), 0);
        assert_eq!(session.draft(), "Hola");
        session.close().await;
    }

    #[tokio::test]
    async fn counter_opens_new_active_proposal() {
        let hub = LocalHub::new();
        let api = FakeApi {
            proposals: vec![pending("p1")],
            ..Default::default()
        };
        let session = SessionController::open("c1", Config::default(), deps(api, &hub))
            .await
            .unwrap();

        let offer = Some(ProposalDraft::price(25.0, "25 and it's yours"));
        let resolution = session
            .respond("p1", ResponseAction::Counter, offer, None)
            .await
            .unwrap();
        assert!(matches!(
            resolution,
            Resolution::Countered { ref original, .. } if original == "p1"
        ));
        assert_eq!(session.proposal("p1").unwrap().state, ProposalState::Countered);
        let active = session.active_proposal().unwrap();
        assert_eq!(active.id, "p-counter");
        assert_eq!(active.parent_id.as_deref(), Some("p1"));

        let missing = session.respond("p-counter", ResponseAction::Counter, None, None).await;
        assert!(matches!(missing, Err(SessionError::Validation(_))));
        session.close().await;
    }

    #[tokio::test]
    async fn image_send_uploads_first() {
        let hub = LocalHub::new();
        let deps = deps(FakeApi::default(), &hub);
        let session = SessionController::open("c1", Config::default(), deps)
            .await
            .unwrap();
        session
            .send_image("lamp.jpg", "image/jpeg", vec![0xff, 0xd8], "the lamp")
            .await
            .unwrap();
        assert!(session
            .send_image("empty.jpg", "image/jpeg", Vec::new(), "")
            .await
            .is_err());
        assert_eq!(session.message_count(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn actions_after_close_are_refused() {
        let hub = LocalHub::new();
        let deps = deps(FakeApi::default(), &hub);
        let session = SessionController::open("c1", Config::default(), deps)
            .await
            .unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(session.connection_state(), ConnectionState::Closed);
        assert!(matches!(
            session.send_text("late").await,
            Err(SessionError::InvalidState(_))
        ));
        assert_eq!(hub.subscriber_count("c1"), 0);
    }
}
