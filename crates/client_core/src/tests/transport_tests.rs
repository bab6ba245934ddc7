use super::*;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    seen_headers: Arc<Mutex<Vec<(Option<String>, Option<String>)>>>,
    seen_queries: Arc<Mutex<Vec<std::collections::HashMap<String, String>>>>,
    seen_bodies: Arc<Mutex<Vec<Value>>>,
}

async fn record_headers(state: &ServerState, headers: &HeaderMap) {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let directory = headers
        .get(DIRECTORY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.seen_headers.lock().await.push((auth, directory));
}

async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn transport_for(base_url: String) -> HttpTransport {
    HttpTransport::new(HttpTransportConfig {
        base_url,
        auth_token: Some("secret-token".into()),
        directory: Some("/work/repo".into()),
        ..HttpTransportConfig::default()
    })
    .expect("transport")
}

fn message_json(id: &str, role: &str, created: i64, text: &str) -> Value {
    json!({
        "info": { "id": id, "sessionID": "ses_1", "role": role, "time": { "created": created } },
        "parts": [{ "id": format!("prt_{id}"), "type": "text", "text": text }]
    })
}

#[tokio::test]
async fn streams_decoded_events_from_global_endpoint() {
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/global/event",
            get(
                |State(state): State<ServerState>, headers: HeaderMap| async move {
                    record_headers(&state, &headers).await;
                    let body = concat!(
                        "data: {\"directory\":\"/work/repo\",\"payload\":{\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_1\"}}}\n\n",
                        "event: message.removed\n",
                        "data: {\"directory\":\"/work/repo\",\"payload\":{\"properties\":{\"sessionID\":\"ses_1\",\"messageID\":\"msg_2\"}}}\n\n",
                    );
                    ([(header::CONTENT_TYPE, "text/event-stream")], body)
                },
            ),
        )
        .with_state(state.clone());
    let transport = transport_for(spawn_server(app).await);

    let stream = transport
        .subscribe_events(Some("/other/repo"))
        .await
        .expect("subscribe");
    let events: Vec<Event> = stream
        .map(|item| item.expect("event"))
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        Event::SessionStatus { status: shared::domain::SessionStatus::Idle, .. }
    ));
    assert!(matches!(
        &events[1],
        Event::MessageRemoved { message_id, .. } if message_id == "msg_2"
    ));

    let headers = state.seen_headers.lock().await.clone();
    assert_eq!(
        headers,
        vec![(
            Some("Bearer secret-token".to_string()),
            Some("/other/repo".to_string())
        )]
    );
}

#[tokio::test]
async fn unauthorized_subscription_maps_to_unauthorized() {
    let app = Router::new().route(
        "/global/event",
        get(|| async { (StatusCode::UNAUTHORIZED, "bad token") }),
    );
    let transport = transport_for(spawn_server(app).await);

    match transport.subscribe_events(None).await {
        Err(err) => assert!(err.is_unauthorized(), "unexpected error: {err}"),
        Ok(_) => panic!("subscription should fail"),
    }
}

#[tokio::test]
async fn cleared_credentials_and_new_directory_apply_to_later_requests() {
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/permission",
            get(
                |State(state): State<ServerState>, headers: HeaderMap| async move {
                    record_headers(&state, &headers).await;
                    Json(json!([]))
                },
            ),
        )
        .with_state(state.clone());
    let transport = transport_for(spawn_server(app).await);

    transport.pending_permissions().await.expect("first poll");
    transport.set_auth_token(None).await;
    transport.set_directory(Some("/next/repo")).await;
    transport.pending_permissions().await.expect("second poll");

    let headers = state.seen_headers.lock().await.clone();
    assert_eq!(
        headers,
        vec![
            (
                Some("Bearer secret-token".to_string()),
                Some("/work/repo".to_string())
            ),
            (None, Some("/next/repo".to_string())),
        ]
    );
}

#[tokio::test]
async fn loads_messages_with_limit_and_reverse() {
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/session/:id/message",
            get(
                |State(state): State<ServerState>,
                 Path(id): Path<String>,
                 Query(query): Query<std::collections::HashMap<String, String>>,
                 headers: HeaderMap| async move {
                    assert_eq!(id, "ses_1");
                    record_headers(&state, &headers).await;
                    state.seen_queries.lock().await.push(query);
                    Json(json!([
                        message_json("msg_2", "assistant", 20, "hi"),
                        message_json("msg_1", "user", 10, "hello"),
                    ]))
                },
            ),
        )
        .with_state(state.clone());
    let transport = transport_for(spawn_server(app).await);

    let messages = transport
        .get_messages("ses_1", Some(50), true)
        .await
        .expect("messages");

    assert_eq!(messages.len(), 2);
    assert!(messages[0].is_assistant());
    assert_eq!(messages[1].plain_text(), "hello");

    let queries = state.seen_queries.lock().await.clone();
    assert_eq!(queries[0].get("limit").map(String::as_str), Some("50"));
    assert_eq!(queries[0].get("reverse").map(String::as_str), Some("1"));
    let headers = state.seen_headers.lock().await.clone();
    assert_eq!(headers[0].1.as_deref(), Some("/work/repo"));
}

#[tokio::test]
async fn send_posts_prompt_parts_and_returns_assistant_reply() {
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/session/:id/message",
            post(
                |State(state): State<ServerState>, Json(body): Json<Value>| async move {
                    state.seen_bodies.lock().await.push(body);
                    Json(json!({
                        "info": {
                            "id": "msg_9",
                            "sessionID": "ses_2",
                            "role": "assistant",
                            "time": { "created": 5, "completed": 9 },
                            "providerID": "anthropic",
                            "modelID": "sonnet"
                        },
                        "parts": []
                    }))
                },
            ),
        )
        .with_state(state.clone());
    let transport = transport_for(spawn_server(app).await);

    let reply = transport
        .send_message(
            "ses_1",
            SendMessageRequest {
                parts: vec![shared::protocol::PromptPartDto::Text {
                    text: "Fix the bug".into(),
                }],
                model: Some(shared::protocol::ModelRefDto {
                    provider_id: "anthropic".into(),
                    model_id: "sonnet".into(),
                }),
                agent: Some("build".into()),
                variant: None,
                system: None,
            },
        )
        .await
        .expect("send");

    assert_eq!(reply.id, "msg_9");
    assert_eq!(reply.session_id, "ses_2");
    assert!(reply.completed_at.is_some());

    let bodies = state.seen_bodies.lock().await.clone();
    assert_eq!(
        bodies[0],
        json!({
            "parts": [{ "type": "text", "text": "Fix the bug" }],
            "model": { "providerID": "anthropic", "modelID": "sonnet" },
            "agent": "build"
        })
    );
}

#[tokio::test]
async fn server_error_body_maps_to_named_error() {
    let app = Router::new().route(
        "/session/:id",
        get(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "name": "NotFoundError", "data": { "message": "no session" } })),
            )
        }),
    );
    let transport = transport_for(spawn_server(app).await);

    let err = transport.get_session("missing").await.expect_err("should fail");
    assert_eq!(
        err,
        ApiError::NotFound {
            message: "no session".into()
        }
    );
}

#[tokio::test]
async fn abort_accepts_loose_bodies_and_rejects_failures() {
    let app = Router::new()
        .route(
            "/session/ok/abort",
            post(|| async { Json(json!({ "aborted": true })) }),
        )
        .route(
            "/session/gone/abort",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR.into_response() }),
        );
    let transport = transport_for(spawn_server(app).await);

    assert!(transport.abort_session("ok").await.expect("abort ok"));
    assert!(!transport.abort_session("gone").await.expect("abort rejected"));
}

#[tokio::test]
async fn replies_to_permission_and_lists_pending() {
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/permission",
            get(|| async {
                Json(json!([{ "id": "per_1", "sessionID": "ses_1", "permission": "edit" }]))
            }),
        )
        .route(
            "/permission/:id/reply",
            post(
                |State(state): State<ServerState>, Json(body): Json<Value>| async move {
                    state.seen_bodies.lock().await.push(body);
                    Json(json!(true))
                },
            ),
        )
        .with_state(state.clone());
    let transport = transport_for(spawn_server(app).await);

    let pending = transport.pending_permissions().await.expect("pending");
    assert_eq!(pending[0].request_id, "per_1");

    transport
        .reply_permission("per_1", PermissionReply::Always, None)
        .await
        .expect("reply");
    let bodies = state.seen_bodies.lock().await.clone();
    assert_eq!(bodies[0], json!({ "reply": "always" }));
}

#[test]
fn rejects_non_http_server_urls() {
    let result = HttpTransport::new(HttpTransportConfig {
        base_url: "ftp://example.com".into(),
        ..HttpTransportConfig::default()
    });
    assert!(result.is_err());
}
