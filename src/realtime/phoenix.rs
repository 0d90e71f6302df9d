//! Websocket adapter for the hosted realtime service (Phoenix channel
//! protocol, JSON serializer v1).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{
    channel_name, ChannelEvent, ChannelHandle, RealtimeProvider, SubscribeRequest, Subscription,
};
use crate::chat::ChatMessage;
use crate::config::Config;
use crate::error::{Result, SessionError};

const JOIN_REF: &str = "1";
const PROTOCOL_VSN: &str = "1.0.0";
const MESSAGES_TABLE: &str = "messages";
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

impl Frame {
    fn new(topic: &str, event: &str, payload: Value, reference: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference,
            join_ref: Some(JOIN_REF.to_string()),
        }
    }

    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

fn join_frame(topic: &str, request: &SubscribeRequest, table: &str) -> Frame {
    let payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": request.presence_key },
            "postgres_changes": [{
                "event": "INSERT",
                "schema": "public",
                "table": table,
                "filter": format!("chat_id=eq.{}", request.chat_id),
            }],
        },
        "access_token": request.access_token,
    });
    Frame::new(topic, "phx_join", payload, Some(JOIN_REF.to_string()))
}

fn track_frame(topic: &str, presence_key: &str, reference: u64) -> Frame {
    let payload = json!({
        "type": "presence",
        "event": "track",
        "payload": {
            "user_id": presence_key,
            "online_at": chrono::Utc::now().to_rfc3339(),
        },
    });
    Frame::new(topic, "presence", payload, Some(reference.to_string()))
}

fn heartbeat_frame(reference: u64) -> Frame {
    Frame {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

/// Presence keys with how many live connections each has.
#[derive(Debug, Default)]
struct PresenceState {
    keys: BTreeMap<String, usize>,
}

impl PresenceState {
    fn replace(&mut self, state: &Value) {
        self.keys.clear();
        if let Some(map) = state.as_object() {
            for (key, entry) in map {
                self.keys.insert(key.clone(), meta_count(entry));
            }
        }
    }

    fn apply_diff(&mut self, diff: &Value) {
        if let Some(joins) = diff.get("joins").and_then(Value::as_object) {
            for (key, entry) in joins {
                *self.keys.entry(key.clone()).or_default() += meta_count(entry);
            }
        }
        if let Some(leaves) = diff.get("leaves").and_then(Value::as_object) {
            for (key, entry) in leaves {
                if let Some(count) = self.keys.get_mut(key) {
                    *count = count.saturating_sub(meta_count(entry));
                    if *count == 0 {
                        self.keys.remove(key);
                    }
                }
            }
        }
    }

    fn sync(&self) -> ChannelEvent {
        ChannelEvent::PresenceSync(self.keys.keys().cloned().collect())
    }
}

fn meta_count(entry: &Value) -> usize {
    entry
        .get("metas")
        .and_then(Value::as_array)
        .map_or(1, |metas| metas.len().max(1))
}

/// Translate one inbound frame into channel events.
fn decode_frame(topic: &str, presence: &mut PresenceState, text: &str) -> Vec<ChannelEvent> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring malformed realtime frame: {}", e);
            return Vec::new();
        }
    };
    if frame.topic != topic {
        return Vec::new();
    }

    match frame.event.as_str() {
        "postgres_changes" => {
            let data = &frame.payload["data"];
            if data["type"] != "INSERT" {
                return Vec::new();
            }
            match serde_json::from_value::<ChatMessage>(data["record"].clone()) {
                Ok(message) => vec![ChannelEvent::InsertMessage(message)],
                Err(e) => {
                    warn!("Ignoring undecodable message record: {}", e);
                    Vec::new()
                }
            }
        }
        "presence_state" => {
            presence.replace(&frame.payload);
            vec![presence.sync()]
        }
        "presence_diff" => {
            presence.apply_diff(&frame.payload);
            vec![presence.sync()]
        }
        "phx_error" | "phx_close" => vec![ChannelEvent::Closed {
            reason: format!("server sent {}", frame.event),
        }],
        _ => Vec::new(),
    }
}

enum Command {
    Track(String),
    Leave,
}

struct PhoenixHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle for PhoenixHandle {
    fn track(&self, presence_key: &str) -> Result<()> {
        self.commands
            .send(Command::Track(presence_key.to_string()))
            .map_err(|_| SessionError::Channel("realtime socket is gone".to_string()))
    }

    fn release(&self) {
        let _ = self.commands.send(Command::Leave);
    }
}

#[derive(Debug, Clone)]
pub struct PhoenixRealtime {
    endpoint: String,
    api_key: Option<String>,
    heartbeat: Duration,
    join_timeout: Duration,
}

impl PhoenixRealtime {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            heartbeat: DEFAULT_HEARTBEAT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        let endpoint = config.realtime_url.clone()?;
        Some(Self::new(endpoint, config.api_key.clone()))
    }

    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = every;
        self
    }

    fn socket_url(&self) -> Result<String> {
        let bad_endpoint = |reason: String| {
            let endpoint = &self.endpoint;
            SessionError::Channel(format!("invalid realtime endpoint {}: {}", endpoint, reason))
        };
        let mut url = reqwest::Url::parse(&self.endpoint).map_err(|e| bad_endpoint(e.to_string()))?;
        let has_socket_segment = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            == Some("websocket");
        url.path_segments_mut()
            .map_err(|_| bad_endpoint("cannot take a path".to_string()))?
            .pop_if_empty()
            .extend((!has_socket_segment).then_some("websocket"));
        {
            let mut query = url.query_pairs_mut();
            if let Some(key) = &self.api_key {
                query.append_pair("apikey", key);
            }
            query.append_pair("vsn", PROTOCOL_VSN);
        }
        Ok(url.into())
    }
}

#[async_trait]
impl RealtimeProvider for PhoenixRealtime {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription> {
        let url = self.socket_url()?;
        let topic = format!("realtime:{}", channel_name(&request.chat_id));

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (socket, _) = tokio::time::timeout(self.join_timeout, connect)
            .await
            .map_err(|_| SessionError::Channel("realtime connect timed out".to_string()))?
            .map_err(|e| SessionError::Channel(format!("realtime connect failed: {}", e)))?;
        let (mut sink, mut stream) = socket.split();

        sink.send(join_frame(&topic, request, MESSAGES_TABLE).to_message()?)
            .await
            .map_err(|e| SessionError::Channel(format!("failed to send join: {}", e)))?;

        // Wait for the join reply before handing out the subscription.
        let mut presence = PresenceState::default();
        let mut early = Vec::new();
        let joined = tokio::time::timeout(self.join_timeout, async {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(t)) => t.to_string(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(SessionError::Channel(e.to_string())),
                };
                let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                    continue;
                };
                if frame.event == "phx_reply" && frame.reference.as_deref() == Some(JOIN_REF) {
                    return match frame.payload["status"].as_str() {
                        Some("ok") => Ok(()),
                        _ => Err(SessionError::Channel(format!(
                            "join refused: {}",
                            frame.payload["response"]
                        ))),
                    };
                }
                early.extend(decode_frame(&topic, &mut presence, &text));
            }
            Err(SessionError::Channel("socket closed before join reply".to_string()))
        })
        .await
        .map_err(|_| SessionError::Channel("realtime join timed out".to_string()))?;
        joined?;
        info!("Joined realtime topic {}", topic);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        for event in early {
            let _ = event_tx.send(event);
        }
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();
        let heartbeat_every = self.heartbeat;

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_every);
            heartbeat.tick().await;
            let mut next_ref: u64 = 2;
            let closed_reason = loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        next_ref += 1;
                        let frame = heartbeat_frame(next_ref);
                        if let Ok(message) = frame.to_message() {
                            if let Err(e) = sink.send(message).await {
                                break Some(format!("heartbeat failed: {}", e));
                            }
                        }
                    }
                    command = command_rx.recv() => match command {
                        Some(Command::Track(key)) => {
                            next_ref += 1;
                            if let Ok(message) = track_frame(&topic, &key, next_ref).to_message() {
                                if let Err(e) = sink.send(message).await {
                                    break Some(format!("presence track failed: {}", e));
                                }
                            }
                        }
                        Some(Command::Leave) | None => {
                            next_ref += 1;
                            let reference = Some(next_ref.to_string());
                            let leave = Frame::new(&topic, "phx_leave", json!({}), reference);
                            if let Ok(message) = leave.to_message() {
                                let _ = sink.send(message).await;
                            }
                            let _ = sink.close().await;
                            break None;
                        }
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let mut dead = None;
                            for event in decode_frame(&topic, &mut presence, text.as_str()) {
                                if let ChannelEvent::Closed { reason } = &event {
                                    dead = Some(reason.clone());
                                }
                                let _ = event_tx.send(event);
                            }
                            if dead.is_some() {
                                break None;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break Some("socket closed".to_string())
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                    },
                }
            };
            if let Some(reason) = closed_reason {
                error!("Realtime topic {} dropped: {}", topic, reason);
                let _ = event_tx.send(ChannelEvent::Closed { reason });
            } else {
                debug!("Realtime topic {} closed", topic);
            }
        });

        Ok(Subscription::new(
            request.chat_id.clone(),
            event_rx,
            Box::new(PhoenixHandle {
                commands: command_tx,
            }),
        ))
    }
}
