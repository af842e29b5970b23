use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Multipart, Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::{RoomId, UserId};
use tokio::{net::TcpListener, sync::Mutex, time::timeout};

use crate::{
    api::{ChatApi, HttpChatApi},
    error::ApiError,
    reconnect::ConnectionState,
    test_support::wait_for_state,
    uploads::LocalFile,
    ChatSession, ClientEvent, ClientSettings, SendOutcome, SessionDependencies, SessionIdentity,
};

#[derive(Debug, Clone, PartialEq)]
struct ReceivedUpload {
    file_name: String,
    content_type: String,
    size: usize,
    room_id: String,
    sender_id: String,
}

#[derive(Default)]
struct Recorded {
    authorization: Vec<String>,
    uploads: Vec<ReceivedUpload>,
    joined: Vec<String>,
}

#[derive(Clone, Default)]
struct ServerState {
    recorded: Arc<Mutex<Recorded>>,
    reject_uploads: bool,
}

fn wire_message(room_id: &str, sender_id: &str, content: &str) -> Value {
    json!({
        "message_id": format!("{room_id}-{content}"),
        "room_id": room_id,
        "sender_id": sender_id,
        "sender_name": sender_id,
        "content": content,
        "message_type": "text",
        "timestamp": "2024-05-01T10:00:00.000000",
    })
}

async fn list_rooms(State(state): State<ServerState>, headers: HeaderMap) -> Json<Value> {
    if let Some(value) = headers.get("authorization") {
        state
            .recorded
            .lock()
            .await
            .authorization
            .push(value.to_str().unwrap_or_default().to_string());
    }
    Json(json!([
        {
            "room_id": "career",
            "name": "Career Guidance",
            "description": "Ask the counsellors",
            "members": ["me", "ravi", "me"],
            "member_count": 2,
        }
    ]))
}

async fn create_room(Json(request): Json<Value>) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Room created successfully",
        "data": {
            "room": {
                "room_id": "interview",
                "name": request["name"],
                "description": request["description"],
                "room_type": request["room_type"],
                "members": ["me"],
            }
        }
    }))
}

async fn room_messages(Path(room_id): Path<String>) -> Json<Value> {
    Json(json!([
        wire_message(&room_id, "ravi", "welcome"),
        wire_message(&room_id, "me", "thanks"),
    ]))
}

async fn online_users() -> Json<Value> {
    Json(json!({ "online_users": ["me", "ravi"], "total_count": 2 }))
}

async fn upload(State(state): State<ServerState>, mut multipart: Multipart) -> impl IntoResponse {
    if state.reject_uploads {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "detail": "file too large" })),
        );
    }
    let mut received = ReceivedUpload {
        file_name: String::new(),
        content_type: String::new(),
        size: 0,
        room_id: String::new(),
        sender_id: String::new(),
    };
    while let Some(field) = multipart.next_field().await.expect("multipart field") {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                received.file_name = field.file_name().unwrap_or_default().to_string();
                received.content_type = field.content_type().unwrap_or_default().to_string();
                received.size = field.bytes().await.expect("file bytes").len();
            }
            "room_id" => received.room_id = field.text().await.expect("room id"),
            "sender_id" => received.sender_id = field.text().await.expect("sender id"),
            _ => {}
        }
    }
    let file_url = format!("/uploads/{}", received.file_name);
    state.recorded.lock().await.uploads.push(received);
    (StatusCode::OK, Json(json!({ "file_url": file_url })))
}

async fn chat_socket(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay(socket, user_id, state))
}

/// Echoes chat messages back to the sender, as the backend broadcasts to the
/// whole room including the author.
async fn relay(mut socket: WebSocket, user_id: String, state: ServerState) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let data = &frame["data"];
        let room_id = data["room_id"].as_str().unwrap_or_default().to_string();
        match frame["type"].as_str() {
            Some("join_room") => state.recorded.lock().await.joined.push(room_id),
            Some("message") => {
                let content = data["content"].as_str().unwrap_or_default();
                let echo = json!({
                    "type": "message",
                    "data": wire_message(&room_id, &user_id, content),
                });
                if socket.send(Message::Text(echo.to_string())).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
}

async fn spawn_chat_server(reject_uploads: bool) -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = ServerState {
        reject_uploads,
        ..ServerState::default()
    };
    let app = Router::new()
        .route("/api/chat/rooms", get(list_rooms).post(create_room))
        .route("/api/chat/rooms/:room_id/messages", get(room_messages))
        .route("/api/chat/online-users", get(online_users))
        .route("/api/chat/upload", post(upload))
        .route("/api/chat/ws/:user_id", get(chat_socket))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn settings(server_url: String) -> ClientSettings {
    ClientSettings {
        server_url,
        auth_token: Some("session-token".into()),
        ..ClientSettings::default()
    }
}

#[tokio::test]
async fn rest_client_speaks_the_chat_api() {
    let (server_url, state) = spawn_chat_server(false).await;
    let api = HttpChatApi::new(settings(server_url));

    let rooms = api.list_rooms().await.expect("rooms");
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].name, "Career Guidance");
    assert_eq!(rooms[0].room_type, "general");
    assert_eq!(
        rooms[0].member_ids,
        vec![UserId::from("me"), UserId::from("ravi")]
    );

    let created = api
        .create_room(shared::protocol::CreateRoomRequest {
            name: "Interview Prep".into(),
            description: "Mock interviews".into(),
            room_type: "general".into(),
        })
        .await
        .expect("room created");
    assert_eq!(created.room_id, RoomId::from("interview"));
    assert_eq!(created.name, "Interview Prep");

    let history = api
        .fetch_messages(&RoomId::from("career"))
        .await
        .expect("history");
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["welcome", "thanks"]);

    let online = api.online_users().await.expect("online users");
    assert_eq!(online, vec![UserId::from("me"), UserId::from("ravi")]);

    let file_url = api
        .upload_file(
            &RoomId::from("career"),
            &UserId::from("me"),
            &LocalFile::new("resume.pdf", vec![0x25; 4096]),
        )
        .await
        .expect("upload");
    assert_eq!(file_url, "/uploads/resume.pdf");

    let recorded = state.recorded.lock().await;
    assert_eq!(recorded.authorization, vec!["Bearer session-token"]);
    assert_eq!(
        recorded.uploads,
        vec![ReceivedUpload {
            file_name: "resume.pdf".into(),
            content_type: "application/pdf".into(),
            size: 4096,
            room_id: "career".into(),
            sender_id: "me".into(),
        }]
    );
}

#[tokio::test]
async fn rejected_upload_reports_status_and_detail() {
    let (server_url, _state) = spawn_chat_server(true).await;
    let api = HttpChatApi::new(settings(server_url));

    let err = api
        .upload_file(
            &RoomId::from("career"),
            &UserId::from("me"),
            &LocalFile::new("huge.mov", vec![0; 1024]),
        )
        .await
        .expect_err("rejected");
    match err {
        ApiError::Rejected { status, detail, .. } => {
            assert_eq!(status, 413);
            assert_eq!(detail, "file too large");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let api = HttpChatApi::new(settings(format!("http://{addr}")));
    let err = api.list_rooms().await.expect_err("nothing listening");
    assert!(matches!(err, ApiError::Unavailable(_)));
}

#[tokio::test]
async fn session_round_trips_over_a_websocket() {
    let (server_url, state) = spawn_chat_server(false).await;
    let settings = settings(server_url);
    let session = ChatSession::start(
        settings.clone(),
        SessionIdentity::new("me", "Asha"),
        SessionDependencies::http(&settings),
    )
    .await
    .expect("session");
    let mut events = session.subscribe_events();

    let mut connection_state = session.connection().watch_state();
    wait_for_state(&mut connection_state, ConnectionState::is_open).await;
    session.load_rooms().await.expect("rooms");

    let history: Vec<_> = session
        .transcript()
        .await
        .into_iter()
        .map(|message| message.content)
        .collect();
    assert_eq!(history, vec!["welcome", "thanks"]);
    assert_eq!(session.send_text("Hello").await, SendOutcome::Sent);

    let echoed = timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::TranscriptAppended(message)) => break message,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("echo received");
    assert_eq!(echoed.content, "Hello");
    assert_eq!(echoed.sender_id, UserId::from("me"));
    assert_eq!(state.recorded.lock().await.joined, vec!["career"]);

    session.shutdown().await;
    assert_eq!(session.connection().state(), ConnectionState::Closed);
}
