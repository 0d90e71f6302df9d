use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::session::{SessionController, SessionDeps};

enum Slot {
    Opening,
    Open(SessionController),
}

type Sessions = Arc<Mutex<HashMap<String, Slot>>>;

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<String, Slot>> {
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears an `Opening` slot if the open never completes.
struct OpeningGuard {
    sessions: Sessions,
    chat_id: String,
    armed: bool,
}

impl Drop for OpeningGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut sessions = lock(&self.sessions);
            if matches!(sessions.get(&self.chat_id), Some(Slot::Opening)) {
                sessions.remove(&self.chat_id);
            }
        }
    }
}

/// Keeps at most one live session per chat on this client.
pub struct SessionRegistry {
    config: Config,
    deps: SessionDeps,
    sessions: Sessions,
}

impl SessionRegistry {
    pub fn new(config: Config, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.deps.bus.clone()
    }

    /// Open a session for `chat_id`. Fails with `InvalidState` while another
    /// session for the same chat is open or opening.
    pub async fn open(&self, chat_id: &str) -> Result<SessionController> {
        // Scope the lock so it is dropped before awaiting
        {
            let mut sessions = lock(&self.sessions);
            match sessions.get(chat_id) {
                Some(Slot::Opening) => {
                    return Err(SessionError::InvalidState(format!(
                        "chat {} is already being opened",
                        chat_id
                    )));
                }
                Some(Slot::Open(existing)) if !existing.is_closed() => {
                    return Err(SessionError::InvalidState(format!(
                        "chat {} is already open",
                        chat_id
                    )));
                }
                _ => {}
            }
            sessions.insert(chat_id.to_string(), Slot::Opening);
        }

        let mut guard = OpeningGuard {
            sessions: self.sessions.clone(),
            chat_id: chat_id.to_string(),
            armed: true,
        };
        let opened = SessionController::open(chat_id, self.config.clone(), self.deps.clone()).await;

        let mut sessions = lock(&self.sessions);
        match &opened {
            Ok(controller) => {
                sessions.insert(chat_id.to_string(), Slot::Open(controller.clone()));
                guard.armed = false;
                info!("Registered session for chat {}", chat_id);
            }
            Err(e) => {
                sessions.remove(chat_id);
                guard.armed = false;
                warn!("Could not open chat {}: {}", chat_id, e);
            }
        }
        opened
    }

    pub fn get(&self, chat_id: &str) -> Option<SessionController> {
        match lock(&self.sessions).get(chat_id) {
            Some(Slot::Open(controller)) if !controller.is_closed() => Some(controller.clone()),
            _ => None,
        }
    }

    pub fn open_chats(&self) -> Vec<String> {
        let mut chats: Vec<String> = lock(&self.sessions)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(c) if !c.is_closed()))
            .map(|(id, _)| id.clone())
            .collect();
        chats.sort();
        chats
    }

    /// Close and forget the session for `chat_id`. Returns false if none was open.
    pub async fn close(&self, chat_id: &str) -> bool {
        let removed = {
            let mut sessions = lock(&self.sessions);
            match sessions.get(chat_id) {
                Some(Slot::Open(_)) => sessions.remove(chat_id),
                _ => None,
            }
        };
        match removed {
            Some(Slot::Open(controller)) => {
                controller.close().await;
                true
            }
            _ => false,
        }
    }

    pub async fn close_all(&self) {
        let controllers: Vec<SessionController> = {
            let mut sessions = lock(&self.sessions);
            let open: Vec<String> = sessions
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
                .map(|(id, _)| id.clone())
                .collect();
            open.iter()
                .filter_map(|id| match sessions.remove(id) {
                    Some(Slot::Open(controller)) => Some(controller),
                    _ => None,
                })
                .collect()
        };
        for controller in controllers {
            controller.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ConversationApi, CreateProposalRequest, RespondOutcome, RespondRequest, UploadedImage,
    };
    use crate::auth::{AuthSession, StaticSessionProvider};
    use crate::chat::{ChatInfo, ChatMessage, SendMessageRequest};
    use crate::clock::SystemClock;
    use crate::proposal::Proposal;
    use crate::realtime::LocalHub;
    use async_trait::async_trait;

    struct EmptyApi;

    #[async_trait]
    impl ConversationApi for EmptyApi {
        async fn chat_info(&self, _token: &str, chat_id: &str) -> Result<ChatInfo> {
            Ok(ChatInfo {
                id: chat_id.into(),
                participants: Vec::new(),
                offered_product: None,
                requested_product: None,
                proposals: Vec::new(),
            })
        }

        async fn messages(&self, _token: &str, _chat_id: &str) -> Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }

        async fn send_message(
            &self,
            _: &str,
            _: &str,
            _: &SendMessageRequest,
        ) -> Result<ChatMessage> {
            Err(SessionError::network("not used"))
        }

        async fn create_proposal(
            &self,
            _: &str,
            _: &str,
            _: &CreateProposalRequest,
        ) -> Result<Proposal> {
            Err(SessionError::network("not used"))
        }

        async fn respond_proposal(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &RespondRequest,
        ) -> Result<RespondOutcome> {
            Err(SessionError::network("not used"))
        }

        async fn upload_image(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Vec<u8>,
        ) -> Result<UploadedImage> {
            Err(SessionError::network("not used"))
        }
    }

    fn registry(hub: &LocalHub) -> SessionRegistry {
        SessionRegistry::new(
            Config::default(),
            SessionDeps {
                api: Arc::new(EmptyApi),
                auth: Arc::new(StaticSessionProvider::new(AuthSession::new("token", "me"))),
                realtime: Arc::new(hub.clone()),
                bus: Arc::new(EventBus::new()),
                clock: Arc::new(SystemClock),
            },
        )
    }

    #[tokio::test]
    async fn second_open_is_refused_until_closed() {
        let hub = LocalHub::new();
        let registry = registry(&hub);

        registry.open("c1").await.unwrap();
        assert!(matches!(registry.open("c1").await, Err(SessionError::InvalidState(_))));
        assert_eq!(registry.open_chats(), vec!["c1".to_string()]);
        assert_eq!(hub.subscriber_count("c1"), 1);

        assert!(registry.close("c1").await);
        assert!(!registry.close("c1").await);
        assert_eq!(hub.subscriber_count("c1"), 0);
        registry.open("c1").await.unwrap();
        registry.close_all().await;
        assert!(registry.get("c1").is_none());
    }

    #[tokio::test]
    async fn failed_open_frees_the_slot() {
        let hub = LocalHub::new();
        let registry = registry(&hub);
        hub.fail_next_subscribes(u32::MAX);
        let mut config = Config::default();
        config.reconnect_max_attempts = 1;
        let registry = SessionRegistry { config, ..registry };

        assert!(matches!(registry.open("c1").await, Err(SessionError::Channel(_))));
        hub.fail_next_subscribes(0);
        assert!(registry.open("c1").await.is_ok());
    }
}
