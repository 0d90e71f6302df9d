use crate::participant::{Participant, ProductSnapshot};
use crate::proposal::Proposal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Location,
    Proposal,
    ProposalResponse,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, alias = "chatId")]
    pub chat_id: Option<String>,
    #[serde(alias = "senderId")]
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "is_read", alias = "read", alias = "isRead")]
    pub read: bool,
    #[serde(default, rename = "type", alias = "message_type", alias = "kind")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "imageUrl")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatMessage {
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// What the user typed, before it becomes a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub kind: MessageKind,
    pub content: String,
    pub image_url: Option<String>,
    pub metadata: Option<Value>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            image_url: None,
            metadata: None,
        }
    }

    pub fn image(url: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Image,
            content: caption.into(),
            image_url: Some(url.into()),
            metadata: None,
        }
    }

    pub fn location(lat: f64, lng: f64, label: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Location,
            content: label.into(),
            image_url: None,
            metadata: Some(serde_json::json!({ "lat": lat, "lng": lng })),
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::SessionError;
        match self.kind {
            MessageKind::Text if self.content.trim().is_empty() => {
                Err(SessionError::Validation("message is empty".to_string()))
            }
            MessageKind::Image if self.image_url.as_deref().map_or(true, str::is_empty) => Err(
                SessionError::Validation("image message needs an uploaded image".to_string()),
            ),
            MessageKind::Location => {
                let coords = self
                    .metadata
                    .as_ref()
                    .and_then(|m| Some((m.get("lat")?.as_f64()?, m.get("lng")?.as_f64()?)));
                let in_range = |(lat, lng): (f64, f64)| {
                    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
                };
                match coords {
                    Some(coords) if in_range(coords) => Ok(()),
                    _ => Err(SessionError::Validation("location is out of range".to_string())),
                }
            }
            _ => Ok(()),
        }
    }

    pub fn into_request(self) -> SendMessageRequest {
        SendMessageRequest {
            content: self.content,
            kind: self.kind,
            image_url: self.image_url,
            metadata: self.metadata,
        }
    }
}

/// Body of `POST /chat/{id}/send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none", default)]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Value>,
}

/// Conversation metadata returned by `GET /chat/{id}/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, alias = "offeredProduct")]
    pub offered_product: Option<ProductSnapshot>,
    #[serde(default, alias = "requestedProduct")]
    pub requested_product: Option<ProductSnapshot>,
    #[serde(default)]
    pub proposals: Vec<Proposal>,
}

impl ChatInfo {
    pub fn counterpart(&self, self_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != self_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn message_accepts_snake_and_camel_case() {
        let snake: ChatMessage = serde_json::from_str(
            r#"{"id":"m1","sender_id":"u1","content":"hi",
                "created_at":"2024-05-01T10:00:00Z","is_read":true,"message_type":"text"}"#,
        )
        .unwrap();
        let camel: ChatMessage = serde_json::from_str(
            r#"{"id":"m1","senderId":"u1","content":"hi",
                "createdAt":"2024-05-01T10:00:00Z","read":true,"type":"text"}"#,
        )
        .unwrap();
        assert_eq!(snake, camel);
        assert!(snake.read);
    }

    #[test]
    fn blank_text_is_rejected_before_sending() {
        assert!(matches!(
            MessageDraft::text("   ").validate(),
            Err(SessionError::Validation(_))
        ));
        assert!(MessageDraft::text("Hola").validate().is_ok());
    }

    #[test]
    fn image_needs_url_and_location_needs_valid_coordinates() {
        let mut image = MessageDraft::image("", "");
        assert!(image.validate().is_err());
        image.image_url = Some("https://cdn/img.jpg".into());
        assert!(image.validate().is_ok());

        assert!(MessageDraft::location(40.4, -3.7, "Madrid").validate().is_ok());
        assert!(MessageDraft::location(140.0, -3.7, "nowhere").validate().is_err());
    }

    #[test]
    fn send_request_uses_backend_field_names() {
        let request = MessageDraft::image("https://cdn/a.png", "look").into_request();
        let body = serde_json::to_value(request).unwrap();
        assert_eq!(body["type"], "image");
        assert_eq!(body["imageUrl"], "https://cdn/a.png");
        assert!(body.get("metadata").is_none());
    }
}
