use crate::presence::Presence;
use crate::proposal::Resolution;
use crate::session::ConnectionState;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// The visible message log changed (append, confirm, rollback, read flag)
    MessagesChanged { chat_id: String, len: usize },

    /// Counterpart presence flipped
    PresenceChanged { chat_id: String, presence: Presence },

    /// Realtime connection moved to a new state
    ConnectionChanged { chat_id: String, state: ConnectionState },

    /// Proposal set changed; `active` is the proposal the UI should highlight
    ProposalsChanged { chat_id: String, active: Option<String> },

    /// A send failed; the text goes back into the input
    DraftRestored { chat_id: String, content: String },

    /// Session expired; navigation should redirect to sign-in
    AuthRequired,

    Notification {
        level: NotificationLevel,
        message: String,
        chat_id: Option<String>,
    },
}

impl SessionEvent {
    pub fn resolution_notice(chat_id: &str, resolution: &Resolution) -> Self {
        let message = match resolution {
            Resolution::Accepted(_) => "Proposal accepted".to_string(),
            Resolution::Rejected(_) => "Proposal rejected".to_string(),
            Resolution::Countered { .. } => "Counter-proposal sent".to_string(),
        };
        SessionEvent::Notification {
            level: NotificationLevel::Success,
            message,
            chat_id: Some(chat_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }

    /// Events as a stream. Lagging subscribers skip what they missed.
    pub fn stream(&self) -> impl Stream<Item = SessionEvent> {
        let mut rx = self.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event stream lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
