use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ConversationApi, CreateProposalRequest, RespondOutcome, RespondRequest, UploadedImage};
use crate::chat::{ChatInfo, ChatMessage, SendMessageRequest};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::proposal::Proposal;

/// reqwest-backed client for the conversation service.
#[derive(Clone, Debug)]
pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpConversationApi {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                SessionError::fatal_network(format!("failed to build http client: {}", e))
            })?;
        Self::with_client(client, &config.api_base_url, config.api_key.clone())
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            SessionError::fatal_network(format!("invalid api base url {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(no_path(&base_url));
        }
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Base url plus percent-encoded path segments.
    fn url<I>(&self, segments: I) -> Result<Url>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| no_path(&self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        let request = request.bearer_auth(token);
        match &self.api_key {
            Some(key) => request.header("apikey", key),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let resp = request.send().await.map_err(|e| {
            warn!("{} request failed: {}", what, e);
            SessionError::from(e)
        })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!("{} rejected: {} {}", what, status, text);
            return Err(error_from_response(status, &text));
        }
        resp.json().await.map_err(|e| {
            SessionError::fatal_network(format!("failed to decode {} response: {}", what, e))
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Nested { error: ErrorDetail },
    Flat { error: String },
    Bare { message: String },
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn no_path(base_url: &Url) -> SessionError {
    SessionError::fatal_network(format!("api base url {} cannot take a path", base_url))
}

/// Map a non-2xx response onto the session error taxonomy.
pub(crate) fn error_from_response(status: StatusCode, body: &str) -> SessionError {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Nested { error }) => error.message,
        Ok(ErrorBody::Flat { error }) => error,
        Ok(ErrorBody::Bare { message }) => message,
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => body.trim().to_string(),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SessionError::Auth(message),
        StatusCode::CONFLICT | StatusCode::GONE => SessionError::InvalidState(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SessionError::network(message)
        }
        s if s.is_client_error() => SessionError::Validation(message),
        _ => SessionError::network(message),
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn chat_info(&self, token: &str, chat_id: &str) -> Result<ChatInfo> {
        let url = self.url(["chat", chat_id, "info"])?;
        self.execute(self.authorized(self.client.get(url), token), "chat info")
            .await
    }

    async fn messages(&self, token: &str, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let url = self.url(["chat", chat_id, "messages"])?;
        self.execute(self.authorized(self.client.get(url), token), "chat messages")
            .await
    }

    async fn send_message(
        &self,
        token: &str,
        chat_id: &str,
        request: &SendMessageRequest,
    ) -> Result<ChatMessage> {
        let url = self.url(["chat", chat_id, "send"])?;
        self.execute(
            self.authorized(self.client.post(url), token).json(request),
            "send message",
        )
        .await
    }

    async fn create_proposal(
        &self,
        token: &str,
        chat_id: &str,
        request: &CreateProposalRequest,
    ) -> Result<Proposal> {
        let url = self.url(["chat", chat_id, "proposals"])?;
        self.execute(
            self.authorized(self.client.post(url), token).json(request),
            "create proposal",
        )
        .await
    }

    async fn respond_proposal(
        &self,
        token: &str,
        chat_id: &str,
        proposal_id: &str,
        request: &RespondRequest,
    ) -> Result<RespondOutcome> {
        let url = self.url(["chat", chat_id, "proposals", proposal_id, "respond"])?;
        self.execute(
            self.authorized(self.client.post(url), token).json(request),
            "respond to proposal",
        )
        .await
    }

    async fn upload_image(
        &self,
        token: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedImage> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .map_err(|e| SessionError::Validation(format!("unsupported image type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = self.url(["upload", "image"])?;
        self.execute(
            self.authorized(self.client.post(url), token).multipart(form),
            "image upload",
        )
        .await
    }
}
