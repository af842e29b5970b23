//! Active-room tracking and transcript filtering.
//!
//! The router is registered as a [`SessionHandler`] on the connection, so it
//! sees inbound messages in arrival order and decides membership in the
//! transcript against the active room at the moment of receipt.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ChatMessage, RoomId},
    protocol::ClientFrame,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    connection::{ConnectionHandle, SessionHandler},
    reconnect::ConnectionState,
    ClientEvent,
};

#[derive(Default)]
struct RouterState {
    active_room: Option<RoomId>,
    /// Room the server currently has this session joined to, if any.
    subscribed_room: Option<RoomId>,
    transcript: Vec<ChatMessage>,
}

pub struct RoomRouter {
    connection: ConnectionHandle,
    api: Arc<dyn ChatApi>,
    events: broadcast::Sender<ClientEvent>,
    state: Arc<Mutex<RouterState>>,
}

impl RoomRouter {
    pub fn new(
        connection: ConnectionHandle,
        api: Arc<dyn ChatApi>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            connection,
            api,
            events,
            state: Arc::new(Mutex::new(RouterState::default())),
        }
    }

    pub async fn active_room(&self) -> Option<RoomId> {
        self.state.lock().await.active_room.clone()
    }

    pub async fn transcript(&self) -> Vec<ChatMessage> {
        self.state.lock().await.transcript.clone()
    }

    /// Makes `room_id` the active room. A join frame goes out only when the
    /// connection is open and the session is not already joined to that
    /// room; on an actual change the transcript is reset and history is
    /// refetched.
    pub async fn join_room(&self, room_id: RoomId) {
        let changed = {
            let mut state = self.state.lock().await;
            let changed = state.active_room.as_ref() != Some(&room_id);
            state.active_room = Some(room_id.clone());
            if changed {
                state.transcript.clear();
            }
            if state.subscribed_room.as_ref() != Some(&room_id) {
                let queued = self.connection.queue_frame(ClientFrame::JoinRoom {
                    room_id: room_id.clone(),
                });
                if queued {
                    info!(room_id = %room_id, "router: joined room");
                    state.subscribed_room = Some(room_id.clone());
                }
            }
            changed
        };

        if changed {
            let _ = self
                .events
                .send(ClientEvent::ActiveRoomChanged(Some(room_id.clone())));
            load_history(
                Arc::clone(&self.api),
                Arc::clone(&self.state),
                self.events.clone(),
                room_id,
            )
            .await;
        }
    }

    /// Clears the active room and tells the server when joined.
    pub async fn leave_room(&self) {
        let left = {
            let mut state = self.state.lock().await;
            let left = state.active_room.take();
            if let Some(subscribed) = state.subscribed_room.take() {
                self.connection.queue_frame(ClientFrame::LeaveRoom {
                    room_id: subscribed,
                });
            }
            state.transcript.clear();
            left
        };
        if let Some(room_id) = left {
            info!(room_id = %room_id, "router: left room");
            let _ = self.events.send(ClientEvent::ActiveRoomChanged(None));
        }
    }
}

async fn load_history(
    api: Arc<dyn ChatApi>,
    state: Arc<Mutex<RouterState>>,
    events: broadcast::Sender<ClientEvent>,
    room_id: RoomId,
) {
    let messages = match api.fetch_messages(&room_id).await {
        Ok(messages) => messages,
        Err(err) => {
            warn!(room_id = %room_id, "router: history fetch failed: {err}");
            return;
        }
    };
    replace_transcript(&state, &events, &room_id, messages).await;
}

async fn replace_transcript(
    state: &Mutex<RouterState>,
    events: &broadcast::Sender<ClientEvent>,
    room_id: &RoomId,
    messages: Vec<ChatMessage>,
) {
    let mut state = state.lock().await;
    if state.active_room.as_ref() != Some(room_id) {
        debug!(room_id = %room_id, "router: discarding history for inactive room");
        return;
    }
    state.transcript = messages.clone();
    let _ = events.send(ClientEvent::TranscriptReplaced {
        room_id: room_id.clone(),
        messages,
    });
}

#[async_trait]
impl SessionHandler for RoomRouter {
    async fn on_message(&self, message: &ChatMessage) {
        let mut state = self.state.lock().await;
        if state.active_room.as_ref() != Some(&message.room_id) {
            debug!(room_id = %message.room_id, "router: message for inactive room not shown");
            return;
        }
        state.transcript.push(message.clone());
        let _ = self
            .events
            .send(ClientEvent::TranscriptAppended(message.clone()));
    }

    async fn on_room_history(&self, room_id: &RoomId, messages: &[ChatMessage]) {
        replace_transcript(&self.state, &self.events, room_id, messages.to_vec()).await;
    }

    async fn on_state_change(&self, connection_state: ConnectionState) {
        let mut state = self.state.lock().await;
        if !connection_state.is_open() {
            state.subscribed_room = None;
            return;
        }

        let Some(room_id) = state.active_room.clone() else {
            return;
        };
        let queued = self.connection.queue_frame(ClientFrame::JoinRoom {
            room_id: room_id.clone(),
        });
        if queued {
            info!(room_id = %room_id, "router: rejoined room after connect");
            state.subscribed_room = Some(room_id.clone());
        }
        drop(state);

        tokio::spawn(load_history(
            Arc::clone(&self.api),
            Arc::clone(&self.state),
            self.events.clone(),
            room_id,
        ));
    }
}
