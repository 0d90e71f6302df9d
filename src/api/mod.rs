//! Contract with the conversation service.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatInfo, ChatMessage, SendMessageRequest};
use crate::error::Result;
use crate::proposal::{Proposal, ProposalDraft, ProposalKind, ResponseAction};

pub use http::HttpConversationApi;

/// Body of `POST /chat/{id}/proposals`, also nested as a counter offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProposalRequest {
    pub kind: ProposalKind,
    pub description: String,
    #[serde(rename = "proposedPrice", skip_serializing_if = "Option::is_none", default)]
    pub proposed_price: Option<f64>,
    #[serde(rename = "proposedMeetupTime", skip_serializing_if = "Option::is_none", default)]
    pub proposed_meetup_time: Option<DateTime<Utc>>,
    #[serde(rename = "proposedLocation", skip_serializing_if = "Option::is_none", default)]
    pub proposed_location: Option<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

impl CreateProposalRequest {
    pub fn from_draft(draft: &ProposalDraft, expires_at: DateTime<Utc>) -> Self {
        Self {
            kind: draft.kind(),
            description: draft.description.trim().to_string(),
            proposed_price: draft.proposed_price,
            proposed_meetup_time: draft.proposed_meetup_time,
            proposed_location: draft.proposed_location.clone(),
            expires_at: draft.expires_at.unwrap_or(expires_at),
        }
    }
}

/// Body of `POST /chat/{id}/proposals/{pid}/respond`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondRequest {
    pub action: ResponseAction,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub counter: Option<CreateProposalRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondOutcome {
    pub proposal: Proposal,
    #[serde(default, rename = "counterProposal", alias = "counter_proposal")]
    pub counter_proposal: Option<Proposal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub url: String,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn chat_info(&self, token: &str, chat_id: &str) -> Result<ChatInfo>;

    /// History, oldest first.
    async fn messages(&self, token: &str, chat_id: &str) -> Result<Vec<ChatMessage>>;

    async fn send_message(
        &self,
        token: &str,
        chat_id: &str,
        request: &SendMessageRequest,
    ) -> Result<ChatMessage>;

    async fn create_proposal(
        &self,
        token: &str,
        chat_id: &str,
        request: &CreateProposalRequest,
    ) -> Result<Proposal>;

    async fn respond_proposal(
        &self,
        token: &str,
        chat_id: &str,
        proposal_id: &str,
        request: &RespondRequest,
    ) -> Result<RespondOutcome>;

    async fn upload_image(
        &self,
        token: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedImage>;
}
