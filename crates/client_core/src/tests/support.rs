//! In-memory doubles for the transport, REST, host and microphone seams.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use serde_json::{json, Value};
use shared::{
    domain::{ChatMessage, MessageBody, MessageId, Notification, Room, RoomId, UserId},
    error::ErrorCode,
    protocol::CreateRoomRequest,
};
use tokio::sync::{mpsc, watch, Semaphore};
use url::Url;

use crate::{
    api::ChatApi,
    error::{ApiError, TransportError},
    notifications::{NotificationHost, NotificationPermission},
    reconnect::ConnectionState,
    recording::{CaptureStream, DeviceHandle, Microphone},
    transport::{Connector, FrameSink, TransportLink, WireEvent},
    uploads::LocalFile,
};

pub fn chat_message(room: &str, sender: &str, content: &str) -> ChatMessage {
    ChatMessage {
        message_id: MessageId::new(format!("{room}-{sender}-{content}")),
        room_id: RoomId::from(room),
        sender_id: UserId::from(sender),
        sender_name: sender.to_string(),
        content: content.to_string(),
        body: MessageBody::Text,
        timestamp: Utc::now(),
        is_edited: false,
        is_deleted: false,
    }
}

pub fn message_frame(message: &ChatMessage) -> String {
    json!({ "type": "message", "data": message }).to_string()
}

pub fn room(id: &str, members: &[&str]) -> Room {
    Room {
        room_id: RoomId::from(id),
        name: format!("{id} room"),
        description: String::new(),
        room_type: "general".into(),
        member_ids: members.iter().map(|member| UserId::from(*member)).collect(),
        member_count: members.len() as u32,
    }
}

/// Lets spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub async fn wait_for_state(
    state: &mut watch::Receiver<ConnectionState>,
    wanted: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let reached = tokio::time::timeout(Duration::from_secs(120), state.wait_for(|s| wanted(s)))
        .await
        .expect("state reached in time")
        .expect("driver alive");
    *reached
}

#[derive(Default)]
struct ConnectorState {
    refusals: VecDeque<bool>,
    open_attempts: usize,
    live: Option<futures_mpsc::UnboundedSender<Result<WireEvent, TransportError>>>,
    sent: Vec<String>,
    close_codes: Vec<u16>,
    reject_writes: bool,
}

/// Connector whose links are driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl ScriptedConnector {
    /// Every later frame write fails.
    pub fn reject_writes(&self) {
        self.state.lock().expect("connector state").reject_writes = true;
    }

    /// The next `count` open attempts fail.
    pub fn refuse_next(&self, count: usize) {
        let mut state = self.state.lock().expect("connector state");
        state.refusals.extend(std::iter::repeat(true).take(count));
    }

    pub fn open_attempts(&self) -> usize {
        self.state.lock().expect("connector state").open_attempts
    }

    pub fn push_frame(&self, text: impl Into<String>) {
        let state = self.state.lock().expect("connector state");
        let live = state.live.as_ref().expect("an open link");
        live.unbounded_send(Ok(WireEvent::Text(text.into())))
            .expect("link reader alive");
    }

    pub fn push_message(&self, message: &ChatMessage) {
        self.push_frame(message_frame(message));
    }

    /// Ends the current link as the server would.
    pub fn drop_link(&self, code: Option<u16>) {
        let mut state = self.state.lock().expect("connector state");
        if let Some(live) = state.live.take() {
            let _ = live.unbounded_send(Ok(WireEvent::Closed { code }));
        }
    }

    pub fn sent_frames(&self) -> Vec<Value> {
        self.state
            .lock()
            .expect("connector state")
            .sent
            .iter()
            .map(|text| serde_json::from_str(text).expect("valid outbound json"))
            .collect()
    }

    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.state.lock().expect("connector state").close_codes.clone()
    }
}

struct ScriptedSink {
    state: Arc<Mutex<ConnectorState>>,
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("connector state");
        if state.reject_writes {
            return Err(TransportError::Send("socket buffer full".into()));
        }
        state.sent.push(text);
        Ok(())
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("connector state");
        state.close_codes.push(code);
        state.live = None;
        Ok(())
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let mut state = self.state.lock().expect("connector state");
        state.open_attempts += 1;
        if state.refusals.pop_front().unwrap_or(false) {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "refused".into(),
            });
        }
        let (tx, rx) = futures_mpsc::unbounded();
        state.live = Some(tx);
        Ok(TransportLink {
            sink: Box::new(ScriptedSink {
                state: Arc::clone(&self.state),
            }),
            inbound: rx.boxed(),
        })
    }
}

#[derive(Clone, Debug)]
pub enum UploadBehavior {
    Succeed(String),
    Reject(u16),
    Unreachable,
}

pub struct ScriptedApi {
    pub rooms: Mutex<Vec<Room>>,
    pub history: Mutex<HashMap<RoomId, Vec<ChatMessage>>>,
    pub history_requests: Mutex<Vec<RoomId>>,
    pub online: Mutex<Option<Vec<UserId>>>,
    pub upload: Mutex<UploadBehavior>,
    pub uploaded: Mutex<Vec<(RoomId, UserId, String)>>,
    /// Uploads wait for a permit when set.
    pub upload_gate: Option<Arc<Semaphore>>,
    /// The first online-user lookup waits for a permit when set.
    pub online_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self {
            rooms: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            history_requests: Mutex::new(Vec::new()),
            online: Mutex::new(None),
            upload: Mutex::new(UploadBehavior::Succeed("/uploads/file.bin".into())),
            uploaded: Mutex::new(Vec::new()),
            upload_gate: None,
            online_gate: Mutex::new(None),
        }
    }
}

impl ScriptedApi {
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let api = Self {
            upload_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (api, gate)
    }

    pub fn gated_presence() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let api = Self {
            online_gate: Mutex::new(Some(Arc::clone(&gate))),
            ..Self::default()
        };
        (api, gate)
    }

    pub fn set_history(&self, room_id: &str, messages: Vec<ChatMessage>) {
        self.history
            .lock()
            .expect("history")
            .insert(RoomId::from(room_id), messages);
    }

    pub fn set_online(&self, users: &[&str]) {
        *self.online.lock().expect("online") =
            Some(users.iter().map(|user| UserId::from(*user)).collect());
    }

    pub fn set_upload(&self, behavior: UploadBehavior) {
        *self.upload.lock().expect("upload") = behavior;
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn list_rooms(&self) -> Result<Vec<Room>, ApiError> {
        Ok(self.rooms.lock().expect("rooms").clone())
    }

    async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, ApiError> {
        let mut created = room(&request.name.to_lowercase(), &[]);
        created.name = request.name;
        created.description = request.description;
        self.rooms.lock().expect("rooms").push(created.clone());
        Ok(created)
    }

    async fn fetch_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>, ApiError> {
        self.history_requests
            .lock()
            .expect("history requests")
            .push(room_id.clone());
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upload_file(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        file: &LocalFile,
    ) -> Result<String, ApiError> {
        if let Some(gate) = &self.upload_gate {
            gate.acquire().await.expect("gate open").forget();
        }
        self.uploaded.lock().expect("uploaded").push((
            room_id.clone(),
            sender_id.clone(),
            file.name.clone(),
        ));
        let behavior = self.upload.lock().expect("upload").clone();
        match behavior {
            UploadBehavior::Succeed(url) => Ok(url),
            UploadBehavior::Reject(status) => Err(ApiError::Rejected {
                status,
                code: ErrorCode::from_status(status),
                detail: "upload rejected".into(),
            }),
            UploadBehavior::Unreachable => Err(ApiError::Unavailable("connection refused".into())),
        }
    }

    async fn online_users(&self) -> Result<Vec<UserId>, ApiError> {
        let gate = self.online_gate.lock().expect("online gate").take();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate open").forget();
        }
        self.online
            .lock()
            .expect("online")
            .clone()
            .ok_or_else(|| ApiError::Unavailable("presence offline".into()))
    }
}

pub struct TestHost {
    pub permission: Mutex<NotificationPermission>,
    pub grant_on_request: NotificationPermission,
    pub requests: AtomicUsize,
    pub focused: AtomicBool,
    pub alerts: Mutex<Vec<Notification>>,
    pub cues: AtomicUsize,
}

impl TestHost {
    pub fn new(permission: NotificationPermission) -> Self {
        Self {
            permission: Mutex::new(permission),
            grant_on_request: NotificationPermission::Granted,
            requests: AtomicUsize::new(0),
            focused: AtomicBool::new(true),
            alerts: Mutex::new(Vec::new()),
            cues: AtomicUsize::new(0),
        }
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.lock().expect("alerts").len()
    }
}

#[async_trait]
impl NotificationHost for TestHost {
    fn permission(&self) -> NotificationPermission {
        *self.permission.lock().expect("permission")
    }

    async fn request_permission(&self) -> NotificationPermission {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.permission.lock().expect("permission") = self.grant_on_request;
        self.grant_on_request
    }

    fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    fn show_alert(&self, notification: &Notification) {
        self.alerts
            .lock()
            .expect("alerts")
            .push(notification.clone());
    }

    fn play_cue(&self) {
        self.cues.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestDevice {
    releases: Arc<AtomicUsize>,
    fail_release: bool,
    feed: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    flush_on_release: Option<Vec<u8>>,
}

impl DeviceHandle for TestDevice {
    fn release(&mut self) -> anyhow::Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        // Stopping the device closes its stream, after any buffered tail.
        if let Some(feed) = self.feed.lock().expect("feed").take() {
            if let Some(tail) = self.flush_on_release.take() {
                let _ = feed.send(tail);
            }
        }
        if self.fail_release {
            return Err(anyhow!("device busy"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TestMicrophone {
    pub deny: bool,
    pub fail_release: bool,
    pub acquisitions: AtomicUsize,
    pub releases: Arc<AtomicUsize>,
    /// Bytes the device hands over only when it is released.
    pub flush_on_release: Option<Vec<u8>>,
    feed: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl TestMicrophone {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn failing_release() -> Self {
        Self {
            fail_release: true,
            ..Self::default()
        }
    }

    pub fn flushing_on_release(tail: &[u8]) -> Self {
        Self {
            flush_on_release: Some(tail.to_vec()),
            ..Self::default()
        }
    }

    pub fn feed(&self, chunk: &[u8]) {
        let feed = self.feed.lock().expect("feed");
        feed.as_ref()
            .expect("microphone acquired")
            .send(chunk.to_vec())
            .expect("capture running");
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for TestMicrophone {
    async fn acquire(&self) -> anyhow::Result<CaptureStream> {
        if self.deny {
            return Err(anyhow!("permission denied by user"));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().expect("feed") = Some(tx);
        Ok(CaptureStream {
            chunks: rx,
            mime_type: "audio/wav".into(),
            device: Box::new(TestDevice {
                releases: Arc::clone(&self.releases),
                fail_release: self.fail_release,
                feed: Arc::clone(&self.feed),
                flush_on_release: self.flush_on_release.clone(),
            }),
        })
    }
}
