use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub user_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn new(access_token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            user_id: user_id.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Source of the signed-in user's session.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self) -> Option<AuthSession>;
}

/// Resolve a usable session or fail with `Auth`.
pub async fn require_session(
    provider: &dyn SessionProvider,
    now: DateTime<Utc>,
) -> Result<AuthSession> {
    match provider.get_session().await {
        None => Err(SessionError::Auth("no active session".to_string())),
        Some(session) if session.is_expired(now) => {
            Err(SessionError::Auth("session expired".to_string()))
        }
        Some(session) if session.access_token.trim().is_empty() => {
            Err(SessionError::Auth("session has no access token".to_string()))
        }
        Some(session) => Ok(session),
    }
}

/// Holds one session in memory; `clear` simulates sign-out.
#[derive(Debug, Default)]
pub struct StaticSessionProvider {
    session: Mutex<Option<AuthSession>>,
}

impl StaticSessionProvider {
    pub fn new(session: AuthSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn replace(&self, session: Option<AuthSession>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
    }

    pub fn clear(&self) {
        self.replace(None);
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn get_session(&self) -> Option<AuthSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
