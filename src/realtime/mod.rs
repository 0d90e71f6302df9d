//! Realtime channel contract.
//!
//! A `Subscription` is the scoped handle to one conversation channel. It is
//! released exactly once, either through `unsubscribe` or on drop, so every
//! exit path of the owning session gives the channel back.

pub mod local;
pub mod phoenix;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::chat::ChatMessage;
use crate::error::Result;

pub use local::LocalHub;
pub use phoenix::PhoenixRealtime;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// `insert-message`: a row was added to the conversation's message table.
    InsertMessage(ChatMessage),
    /// `presence-sync`: full list of presence keys currently on the channel.
    PresenceSync(Vec<String>),
    /// The channel dropped; the subscription is dead.
    Closed { reason: String },
}

/// Provider-side half of a subscription.
pub trait ChannelHandle: Send + Sync {
    /// Announce this client's presence on the channel.
    fn track(&self, presence_key: &str) -> Result<()>;

    /// Leave the channel. Called exactly once.
    fn release(&self);
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub chat_id: String,
    pub presence_key: String,
    pub access_token: String,
}

pub struct Subscription {
    chat_id: String,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: Box<dyn ChannelHandle>,
    released: bool,
}

impl Subscription {
    pub fn new(
        chat_id: impl Into<String>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        handle: Box<dyn ChannelHandle>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            events,
            handle,
            released: false,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Next channel event; `None` once the provider side hung up.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.released {
            return None;
        }
        self.events.recv().await
    }

    pub fn track(&self, presence_key: &str) -> Result<()> {
        self.handle.track(presence_key)
    }

    pub fn unsubscribe(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            debug!("Releasing realtime channel for chat {}", self.chat_id);
            self.handle.release();
            self.events.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription>;
}

/// Channel naming shared by every provider.
pub fn channel_name(chat_id: &str) -> String {
    format!("chat:{}", chat_id)
}
