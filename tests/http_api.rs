use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use ecoswap_chat::api::{
    ConversationApi, CreateProposalRequest, HttpConversationApi, RespondRequest,
};
use ecoswap_chat::chat::{MessageDraft, MessageKind};
use ecoswap_chat::config::Config;
use ecoswap_chat::proposal::{ProposalDraft, ProposalState, ResponseAction};
use ecoswap_chat::SessionError;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Backend {
    last_body: Arc<Mutex<Option<Value>>>,
    last_api_key: Arc<Mutex<Option<String>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == "Bearer token")
}

fn proposal_json(id: &str, status: &str) -> Value {
    let now = Utc::now();
    json!({
        "id": id,
        "authorId": "bob",
        "kind": "price",
        "description": "20 for the lamp",
        "proposedPrice": 20.0,
        "status": status,
        "createdAt": now,
        "expiresAt": now + Duration::hours(48),
    })
}

async fn info_handler(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    *backend.last_api_key.lock().unwrap() = headers
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if id == "locked" || !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "jwt expired" }))).into_response();
    }
    Json(json!({
        "id": id,
        "participants": [
            { "id": "me", "name": "Ana" },
            { "id": "bob", "display_name": "Bob", "is_online": true }
        ],
        "offeredProduct": { "id": "prod-1", "title": "Desk lamp", "price": 20.0 },
        "proposals": [proposal_json("p1", "pending")],
    }))
    .into_response()
}

async fn messages_handler(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "db down").into_response(),
        "slow" => {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            Json(json!([])).into_response()
        }
        _ => Json(json!([
            { "id": "m1", "chatId": id, "senderId": "bob", "content": "hi",
              "createdAt": "2024-05-01T10:00:00Z", "isRead": true, "type": "text" },
            { "id": "m2", "chat_id": id, "sender_id": "me", "content": "",
              "created_at": "2024-05-01T10:01:00Z", "message_type": "image",
              "image_url": "https://cdn.ecoswap.test/lamp.jpg" }
        ]))
        .into_response(),
    }
}

async fn send_handler(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    *backend.last_body.lock().unwrap() = Some(body.clone());
    Json(json!({
        "id": "srv-1",
        "chat_id": id,
        "sender_id": "me",
        "content": body["content"],
        "created_at": Utc::now(),
        "is_read": false,
        "message_type": body["type"],
        "metadata": body.get("metadata"),
    }))
}

async fn create_proposal_handler(
    State(backend): State<Backend>,
    Json(body): Json<Value>,
) -> Json<Value> {
    *backend.last_body.lock().unwrap() = Some(body.clone());
    let mut proposal = proposal_json("p2", "pending");
    proposal["description"] = body["description"].clone();
    Json(proposal)
}

async fn respond_handler(
    State(backend): State<Backend>,
    Path((_id, pid)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    *backend.last_body.lock().unwrap() = Some(body.clone());
    if pid == "p-done" {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": { "message": "already accepted" } })),
        )
            .into_response();
    }
    let mut counter = proposal_json("p3", "pending");
    counter["parentId"] = json!(pid);
    Json(json!({
        "proposal": proposal_json(&pid, "countered"),
        "counterProposal": counter,
    }))
    .into_response()
}

async fn upload_handler(mut multipart: Multipart) -> Response {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or("unnamed").to_string();
            let bytes = field.bytes().await.unwrap_or_default();
            let url = format!("https://cdn.ecoswap.test/{}/{}", bytes.len(), name);
            return Json(json!({ "url": url })).into_response();
        }
    }
    (StatusCode::BAD_REQUEST, Json(json!({ "message": "file part missing" }))).into_response()
}

async fn spawn_backend() -> (SocketAddr, Backend) {
    let backend = Backend::default();
    let app = Router::new()
        .route("/api/chat/:id/info", get(info_handler))
        .route("/api/chat/:id/messages", get(messages_handler))
        .route("/api/chat/:id/send", post(send_handler))
        .route("/api/chat/:id/proposals", post(create_proposal_handler))
        .route("/api/chat/:id/proposals/:pid/respond", post(respond_handler))
        .route("/api/upload/image", post(upload_handler))
        .with_state(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, backend)
}

fn client(addr: SocketAddr) -> HttpConversationApi {
    let config = Config {
        api_base_url: format!("http://{}/api/", addr),
        api_key: Some("anon-key".into()),
        request_timeout: std::time::Duration::from_millis(500),
        ..Config::default()
    };
    HttpConversationApi::new(&config).unwrap()
}

#[tokio::test]
async fn loads_info_and_history() {
    let (addr, backend) = spawn_backend().await;
    let api = client(addr);

    let info = api.chat_info("token", "c1").await.unwrap();
    assert_eq!(info.counterpart("me").map(|p| p.display_name.as_str()), Some("Bob"));
    assert_eq!(info.offered_product.unwrap().title, "Desk lamp");
    assert_eq!(info.proposals[0].state, ProposalState::Pending);
    assert_eq!(backend.last_api_key.lock().unwrap().as_deref(), Some("anon-key"));

    let history = api.messages("token", "c1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].read);
    assert_eq!(history[1].kind, MessageKind::Image);
    assert_eq!(history[1].image_url.as_deref(), Some("https://cdn.ecoswap.test/lamp.jpg"));
}

#[tokio::test]
async fn send_posts_wire_body() {
    let (addr, backend) = spawn_backend().await;
    let api = client(addr);

    let request = MessageDraft::location(40.4153, -3.6844, "Retiro gate").into_request();
    let stored = api.send_message("token", "c1", &request).await.unwrap();
    assert_eq!(stored.id, "srv-1");
    assert_eq!(stored.kind, MessageKind::Location);

    let body = backend.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["type"], "location");
    assert_eq!(body["content"], "Retiro gate");
    assert_eq!(body["metadata"]["lat"], 40.4153);
    assert!(body.get("imageUrl").is_none());
}

#[tokio::test]
async fn proposals_round_trip_through_backend() {
    let (addr, backend) = spawn_backend().await;
    let api = client(addr);
    let expires = Utc::now() + Duration::hours(48);

    let draft = ProposalDraft::price(18.0, "18 and I pick it up");
    let created = api
        .create_proposal("token", "c1", &CreateProposalRequest::from_draft(&draft, expires))
        .await
        .unwrap();
    assert_eq!(created.description, "18 and I pick it up");
    let body = backend.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["kind"], "price");
    assert_eq!(body["proposedPrice"], 18.0);

    let counter = ProposalDraft::price(25.0, "25 and it's yours");
    let outcome = api
        .respond_proposal(
            "token",
            "c1",
            "p1",
            &RespondRequest {
                action: ResponseAction::Counter,
                comment: Some("meet halfway?".into()),
                counter: Some(CreateProposalRequest::from_draft(&counter, expires)),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.proposal.state, ProposalState::Countered);
    let counter = outcome.counter_proposal.unwrap();
    assert_eq!(counter.parent_id.as_deref(), Some("p1"));
    let body = backend.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["action"], "counter");
    assert_eq!(body["counter"]["proposedPrice"], 25.0);
}

#[tokio::test]
async fn failures_map_onto_error_kinds() {
    let (addr, _backend) = spawn_backend().await;
    let api = client(addr);

    assert!(matches!(
        api.chat_info("token", "locked").await,
        Err(SessionError::Auth(m)) if m == "jwt expired"
    ));
    assert!(matches!(
        api.chat_info("wrong-token", "c1").await,
        Err(SessionError::Auth(_))
    ));

    let request = RespondRequest {
        action: ResponseAction::Accept,
        comment: None,
        counter: None,
    };
    assert!(matches!(
        api.respond_proposal("token", "c1", "p-done", &request).await,
        Err(SessionError::InvalidState(m)) if m == "already accepted"
    ));

    let broken = api.messages("token", "broken").await.unwrap_err();
    assert!(broken.is_retryable());
    assert!(matches!(broken, SessionError::Network { ref message, .. } if message == "db down"));

    let slow = api.messages("token", "slow").await.unwrap_err();
    assert!(matches!(slow, SessionError::Network { retryable: true, .. }));
}

#[tokio::test]
async fn uploads_image_as_multipart() {
    let (addr, _backend) = spawn_backend().await;
    let api = client(addr);

    let uploaded = api
        .upload_image("token", "lamp.jpg", "image/jpeg", vec![0xff, 0xd8, 0xff])
        .await
        .unwrap();
    assert_eq!(uploaded.url, "https://cdn.ecoswap.test/3/lamp.jpg");

    assert!(matches!(
        api.upload_image("token", "lamp.jpg", "not a mime", vec![1]).await,
        Err(SessionError::Validation(_))
    ));
}
