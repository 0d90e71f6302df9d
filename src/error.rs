use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Missing or expired auth session. Surfaced as a redirect, never a toast.
    #[error("authentication required: {0}")]
    Auth(String),

    #[error("network error: {message}")]
    Network { message: String, retryable: bool },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("channel error: {0}")]
    Channel(String),
}

impl SessionError {
    pub fn network(message: impl Into<String>) -> Self {
        SessionError::Network {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal_network(message: impl Into<String>) -> Self {
        SessionError::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the UI should offer a retry affordance.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Network { retryable, .. } => *retryable,
            SessionError::Channel(_) => true,
            _ => false,
        }
    }

    /// Only auth failures leave the session boundary.
    pub fn escalates(&self) -> bool {
        matches!(self, SessionError::Auth(_))
    }

    /// Message shown to the user. The UI never needs to tell the kinds apart.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Auth(_) => "Your session has expired, please sign in again.".to_string(),
            SessionError::Network { message, .. } => message.clone(),
            SessionError::Validation(message) => message.clone(),
            SessionError::InvalidState(message) => message.clone(),
            SessionError::Channel(_) => "Reconnecting...".to_string(),
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SessionError::network(format!("request timed out: {}", error))
        } else if error.is_decode() {
            SessionError::fatal_network(format!("malformed response: {}", error))
        } else {
            SessionError::network(error.to_string())
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        SessionError::fatal_network(format!("malformed payload: {}", error))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_escalates() {
        assert!(SessionError::Auth("expired".into()).escalates());
        assert!(!SessionError::network("down").escalates());
        assert!(!SessionError::InvalidState("accepted".into()).escalates());
    }

    #[test]
    fn retry_affordance_follows_error_kind() {
        assert!(SessionError::network("timeout").is_retryable());
        assert!(!SessionError::fatal_network("bad json").is_retryable());
        assert!(!SessionError::Validation("empty".into()).is_retryable());
        assert!(SessionError::Channel("dropped".into()).is_retryable());
    }
}
