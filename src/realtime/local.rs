use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    channel_name, ChannelEvent, ChannelHandle, RealtimeProvider, SubscribeRequest, Subscription,
};
use crate::chat::ChatMessage;
use crate::error::{Result, SessionError};

struct Member {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    presence_key: String,
    tracked: bool,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, BTreeMap<u64, Member>>,
    next_member: u64,
    failing_subscribes: u32,
}

impl HubState {
    fn broadcast(&mut self, channel: &str, event: &ChannelEvent) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.retain(|_, m| m.tx.send(event.clone()).is_ok());
        }
    }

    fn sync_presence(&mut self, channel: &str) {
        let keys = self.presence_keys(channel);
        self.broadcast(channel, &ChannelEvent::PresenceSync(keys));
    }

    fn presence_keys(&self, channel: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .channels
            .get(channel)
            .map(|members| {
                members
                    .values()
                    .filter(|m| m.tracked)
                    .map(|m| m.presence_key.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// In-process realtime provider. Every subscriber to the same chat sees the
/// same inserts and presence. Used as a loopback transport and in tests.
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an `insert-message` event to every subscriber of the chat.
    pub fn publish_message(&self, chat_id: &str, message: ChatMessage) {
        self.lock()
            .broadcast(&channel_name(chat_id), &ChannelEvent::InsertMessage(message));
    }

    /// Drop one client's connection, as a network failure would.
    pub fn disconnect(&self, chat_id: &str, presence_key: &str, reason: &str) -> bool {
        let channel = channel_name(chat_id);
        let mut state = self.lock();
        let Some(members) = state.channels.get_mut(&channel) else {
            return false;
        };
        let dropped: Vec<u64> = members
            .iter()
            .filter(|(_, m)| m.presence_key == presence_key)
            .map(|(id, _)| *id)
            .collect();
        for id in &dropped {
            if let Some(member) = members.remove(id) {
                let _ = member.tx.send(ChannelEvent::Closed {
                    reason: reason.to_string(),
                });
            }
        }
        if !dropped.is_empty() {
            info!("Local hub dropped {} from {}", presence_key, channel);
            state.sync_presence(&channel);
        }
        !dropped.is_empty()
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.lock().failing_subscribes = count;
    }

    pub fn subscriber_count(&self, chat_id: &str) -> usize {
        self.lock()
            .channels
            .get(&channel_name(chat_id))
            .map_or(0, BTreeMap::len)
    }

    pub fn presence(&self, chat_id: &str) -> Vec<String> {
        self.lock().presence_keys(&channel_name(chat_id))
    }
}

#[async_trait]
impl RealtimeProvider for LocalHub {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription> {
        let channel = channel_name(&request.chat_id);
        let mut state = self.lock();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(SessionError::Channel(format!("subscribe to {} refused", channel)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = state.next_member;
        state.next_member += 1;
        state.channels.entry(channel.clone()).or_default().insert(
            member_id,
            Member {
                tx,
                presence_key: request.presence_key.clone(),
                tracked: false,
            },
        );
        debug!("Local hub: {} joined {}", request.presence_key, channel);

        let handle = LocalHandle {
            hub: self.clone(),
            channel,
            member_id,
        };
        Ok(Subscription::new(request.chat_id.clone(), rx, Box::new(handle)))
    }
}

struct LocalHandle {
    hub: LocalHub,
    channel: String,
    member_id: u64,
}

impl ChannelHandle for LocalHandle {
    fn track(&self, presence_key: &str) -> Result<()> {
        let mut state = self.hub.lock();
        let member = state
            .channels
            .get_mut(&self.channel)
            .and_then(|members| members.get_mut(&self.member_id))
            .ok_or_else(|| SessionError::Channel("channel is no longer joined".to_string()))?;
        member.presence_key = presence_key.to_string();
        member.tracked = true;
        state.sync_presence(&self.channel);
        Ok(())
    }

    fn release(&self) {
        let mut state = self.hub.lock();
        let removed = state
            .channels
            .get_mut(&self.channel)
            .and_then(|members| members.remove(&self.member_id))
            .is_some();
        if removed {
            state.sync_presence(&self.channel);
        }
        if state.channels.get(&self.channel).map_or(false, BTreeMap::is_empty) {
            state.channels.remove(&self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str) -> SubscribeRequest {
        SubscribeRequest {
            chat_id: "c1".into(),
            presence_key: user.into(),
            access_token: "t".into(),
        }
    }

    #[tokio::test]
    async fn presence_sync_reaches_every_member() {
        let hub = LocalHub::new();
        let mut me = hub.subscribe(&request("me")).await.unwrap();
        let bob = hub.subscribe(&request("bob")).await.unwrap();

        me.track("me").unwrap();
        assert_eq!(me.next_event().await, Some(ChannelEvent::PresenceSync(vec!["me".into()])));
        bob.track("bob").unwrap();
        assert_eq!(
            me.next_event().await,
            Some(ChannelEvent::PresenceSync(vec!["bob".into(), "me".into()]))
        );

        drop(bob);
        assert_eq!(me.next_event().await, Some(ChannelEvent::PresenceSync(vec!["me".into()])));
        assert_eq!(hub.subscriber_count("c1"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_release_the_channel() {
        let hub = LocalHub::new();
        let a = hub.subscribe(&request("me")).await.unwrap();
        let b = hub.subscribe(&request("me")).await.unwrap();
        assert_eq!(hub.subscriber_count("c1"), 2);

        a.unsubscribe();
        assert_eq!(hub.subscriber_count("c1"), 1);
        drop(b);
        assert_eq!(hub.subscriber_count("c1"), 0);
    }

    #[tokio::test]
    async fn disconnect_closes_the_subscription() {
        let hub = LocalHub::new();
        let mut me = hub.subscribe(&request("me")).await.unwrap();
        assert!(hub.disconnect("c1", "me", "network down"));
        assert_eq!(
            me.next_event().await,
            Some(ChannelEvent::Closed {
                reason: "network down".into()
            })
        );
        assert_eq!(me.next_event().await, None);
        assert!(me.track("me").is_err());
    }

    #[tokio::test]
    async fn refused_subscribes_are_counted_down() {
        let hub = LocalHub::new();
        hub.fail_next_subscribes(1);
        assert!(matches!(hub.subscribe(&request("me")).await, Err(SessionError::Channel(_))));
        assert!(hub.subscribe(&request("me")).await.is_ok());
    }
}
