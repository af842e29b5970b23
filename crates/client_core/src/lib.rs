use std::sync::Arc;

use shared::{
    domain::{ChatMessage, MessageBody, Notification, NotificationId, Room, RoomId, UploadId},
    protocol::{ClientFrame, CreateRoomRequest},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod format;
pub mod identity;
pub mod notifications;
pub mod presence;
pub mod reconnect;
pub mod recording;
pub mod router;
pub mod transport;
pub mod uploads;

pub use api::{ChatApi, HttpChatApi, MissingChatApi};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionHandle, ConnectionManager, SendGuard, SendOutcome, SessionHandler};
pub use error::{ApiError, ConfigError, RecordingError, TransportError, UploadError};
pub use identity::{SessionIdentity, StoredProfile};
pub use notifications::{
    HeadlessHost, NotificationDispatcher, NotificationHost, NotificationPermission,
};
pub use presence::{PresenceResolver, PresenceSource, ResolvedMembers};
pub use reconnect::{ConnectionState, ReconnectPolicy};
pub use recording::{AudioRecorder, Microphone, MissingMicrophone, RecordingState, VoiceClip};
pub use router::RoomRouter;
pub use transport::{Connector, MissingConnector, WsConnector};
pub use uploads::{LocalFile, UploadOutcome, UploadPipeline, UploadTask};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    ActiveRoomChanged(Option<RoomId>),
    TranscriptAppended(ChatMessage),
    TranscriptReplaced {
        room_id: RoomId,
        messages: Vec<ChatMessage>,
    },
    NotificationRaised(Notification),
    NotificationRemoved(NotificationId),
    MembersResolved(ResolvedMembers),
    UploadStarted(UploadTask),
    UploadSettled {
        id: UploadId,
        outcome: UploadOutcome,
    },
    RecordingStateChanged(RecordingState),
    RecordingTick {
        elapsed_secs: u32,
    },
    /// Non-fatal, user-facing problem (upload fallback, microphone).
    Warning(String),
    ServerError(String),
}

/// Collaborators a session is built from.
pub struct SessionDependencies {
    pub api: Arc<dyn ChatApi>,
    pub connector: Arc<dyn Connector>,
    pub host: Arc<dyn NotificationHost>,
    pub microphone: Arc<dyn Microphone>,
}

impl SessionDependencies {
    pub fn http(settings: &ClientSettings) -> Self {
        Self {
            api: Arc::new(HttpChatApi::new(settings.clone())),
            connector: Arc::new(WsConnector),
            host: Arc::new(HeadlessHost),
            microphone: Arc::new(MissingMicrophone),
        }
    }

    pub fn offline() -> Self {
        Self {
            api: Arc::new(MissingChatApi),
            connector: Arc::new(MissingConnector),
            host: Arc::new(HeadlessHost),
            microphone: Arc::new(MissingMicrophone),
        }
    }
}

/// One signed-in user's messaging session: the connection plus everything
/// that consumes it.
pub struct ChatSession {
    identity: SessionIdentity,
    api: Arc<dyn ChatApi>,
    connection: ConnectionHandle,
    driver: Mutex<Option<JoinHandle<()>>>,
    router: Arc<RoomRouter>,
    notifications: Arc<NotificationDispatcher>,
    presence: PresenceResolver,
    uploads: UploadPipeline,
    recorder: AudioRecorder,
    rooms: RwLock<Vec<Room>>,
    presence_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatSession {
    /// Wires the session and starts connecting.
    pub async fn start(
        settings: ClientSettings,
        identity: SessionIdentity,
        deps: SessionDependencies,
    ) -> Result<Arc<Self>, ConfigError> {
        let url = settings.websocket_url(&identity.user_id)?;
        let (events, _) = broadcast::channel(1024);
        let (connection, driver) =
            ConnectionManager::spawn(url, settings.reconnect, deps.connector, events.clone());

        let router = Arc::new(RoomRouter::new(
            connection.clone(),
            Arc::clone(&deps.api),
            events.clone(),
        ));
        let notifications = Arc::new(NotificationDispatcher::new(
            identity.user_id.clone(),
            deps.host,
            settings.notification_ttl,
            settings.sound_enabled,
            events.clone(),
        ));
        connection.subscribe(Arc::clone(&router) as Arc<dyn SessionHandler>);
        connection.subscribe(Arc::clone(&notifications) as Arc<dyn SessionHandler>);

        let session = Arc::new(Self {
            presence: PresenceResolver::new(
                identity.clone(),
                Arc::clone(&deps.api),
                events.clone(),
            ),
            uploads: UploadPipeline::new(
                identity.clone(),
                Arc::clone(&deps.api),
                connection.clone(),
                events.clone(),
            ),
            recorder: AudioRecorder::new(deps.microphone, settings.recording_tick, events.clone()),
            identity,
            api: deps.api,
            connection,
            driver: Mutex::new(Some(driver)),
            router,
            notifications,
            rooms: RwLock::new(Vec::new()),
            presence_task: Mutex::new(None),
            events,
        });

        session.notifications.ensure_permission().await;
        info!(user_id = %session.identity.user_id, "session: starting");
        session.connection.connect();

        let period = settings.presence_refresh_interval;
        let weak = Arc::downgrade(&session);
        let presence_task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.refresh_members().await;
            }
        });
        *session.presence_task.lock().await = Some(presence_task);

        Ok(session)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    /// Fetches the room list and activates the first room when none is
    /// active yet.
    pub async fn load_rooms(&self) -> Result<Vec<Room>, ApiError> {
        let rooms = self.api.list_rooms().await?;
        *self.rooms.write().await = rooms.clone();
        info!(count = rooms.len(), "session: rooms loaded");
        if self.router.active_room().await.is_none() {
            if let Some(first) = rooms.first() {
                self.switch_room(first.room_id.clone()).await;
            }
        }
        Ok(rooms)
    }

    pub async fn create_room(&self, name: &str, description: &str) -> Result<Room, ApiError> {
        let room = self
            .api
            .create_room(CreateRoomRequest {
                name: name.trim().to_string(),
                description: description.trim().to_string(),
                room_type: "general".into(),
            })
            .await?;
        info!(room_id = %room.room_id, "session: room created");
        self.rooms.write().await.push(room.clone());
        Ok(room)
    }

    pub async fn rooms(&self) -> Vec<Room> {
        self.rooms.read().await.clone()
    }

    /// Case-insensitive match on name or description.
    pub async fn filter_rooms(&self, query: &str) -> Vec<Room> {
        self.rooms
            .read()
            .await
            .iter()
            .filter(|room| room.matches_query(query))
            .cloned()
            .collect()
    }

    pub async fn active_room(&self) -> Option<Room> {
        let active = self.router.active_room().await?;
        let rooms = self.rooms.read().await;
        Some(
            rooms
                .iter()
                .find(|room| room.room_id == active)
                .cloned()
                .unwrap_or_else(|| Room {
                    room_id: active.clone(),
                    name: active.to_string(),
                    description: String::new(),
                    room_type: "general".into(),
                    member_ids: Vec::new(),
                    member_count: 0,
                }),
        )
    }

    pub async fn switch_room(&self, room_id: RoomId) {
        self.router.join_room(room_id).await;
        let room = self.active_room().await;
        self.presence.resolve(room.as_ref()).await;
    }

    pub async fn leave_room(&self) {
        self.router.leave_room().await;
    }

    pub async fn transcript(&self) -> Vec<ChatMessage> {
        self.router.transcript().await
    }

    pub async fn members(&self) -> ResolvedMembers {
        self.presence.members().await
    }

    pub async fn refresh_members(&self) -> ResolvedMembers {
        let epoch = self.presence.room_epoch();
        let room = self.active_room().await;
        self.presence.refresh_since(epoch, room.as_ref()).await
    }

    pub async fn send_text(&self, content: &str) -> SendOutcome {
        let Some(room_id) = self.router.active_room().await else {
            return SendOutcome::Skipped(SendGuard::NoActiveRoom);
        };
        self.connection.send(
            &room_id,
            content.trim(),
            &self.identity.display_name,
            &MessageBody::Text,
        )
        .await
    }

    pub async fn set_typing(&self, is_typing: bool) -> SendOutcome {
        let Some(room_id) = self.router.active_room().await else {
            return SendOutcome::Skipped(SendGuard::NoActiveRoom);
        };
        self.connection
            .send_frame(ClientFrame::Typing { room_id, is_typing })
            .await
    }

    /// Starts one upload task per file in the active room.
    pub async fn upload_files(
        &self,
        files: Vec<LocalFile>,
    ) -> Result<Vec<JoinHandle<UploadOutcome>>, UploadError> {
        let room_id = self
            .router
            .active_room()
            .await
            .ok_or(UploadError::NoActiveRoom)?;
        let mut handles = Vec::with_capacity(files.len());
        for file in files {
            handles.push(self.uploads.submit(room_id.clone(), file).await);
        }
        Ok(handles)
    }

    pub async fn uploads_in_flight(&self) -> Vec<UploadTask> {
        self.uploads.in_flight().await
    }

    pub async fn start_recording(&self) -> Result<(), RecordingError> {
        self.recorder.start().await
    }

    pub async fn recording_state(&self) -> RecordingState {
        self.recorder.state().await
    }

    /// Stops the recording and sends the clip to the active room.
    pub async fn stop_recording(&self) -> Result<SendOutcome, RecordingError> {
        let clip = match self.recorder.stop().await {
            Ok(clip) => clip,
            Err(err) => {
                warn!("session: voice message not sent: {err}");
                return Err(err);
            }
        };
        let Some(room_id) = self.router.active_room().await else {
            return Ok(SendOutcome::Skipped(SendGuard::NoActiveRoom));
        };
        Ok(self
            .connection
            .send(
                &room_id,
                &clip.message_text(),
                &self.identity.display_name,
                &clip.body(),
            )
            .await)
    }

    /// Disconnects, stops any recording and ends background work. In-flight
    /// uploads are left to settle on their own.
    pub async fn shutdown(&self) {
        info!(user_id = %self.identity.user_id, "session: shutting down");
        self.connection.disconnect();
        self.recorder.cancel().await;
        if let Some(task) = self.presence_task.lock().await.take() {
            task.abort();
        }
        self.connection.shutdown();
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(err) = driver.await {
                warn!("session: connection driver ended abnormally: {err}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod connection_tests;

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod router_tests;

#[cfg(test)]
#[path = "tests/notification_tests.rs"]
mod notification_tests;

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod presence_tests;

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod upload_tests;

#[cfg(test)]
#[path = "tests/recording_tests.rs"]
mod recording_tests;

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod http_tests;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
