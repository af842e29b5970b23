use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::domain::{ChatMessage, Notification, NotificationId, NotificationKind, UserId};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::{connection::SessionHandler, identity::sender_label, ClientEvent};

/// How many of the newest notifications are shown as toasts.
pub const VISIBLE_TOASTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    /// Not asked yet.
    Default,
    Granted,
    Denied,
}

/// Environment the dispatcher surfaces alerts through.
#[async_trait]
pub trait NotificationHost: Send + Sync {
    fn permission(&self) -> NotificationPermission;
    async fn request_permission(&self) -> NotificationPermission;
    fn is_focused(&self) -> bool;
    fn show_alert(&self, notification: &Notification);
    fn play_cue(&self);
}

/// Host with no alert surface. Permission is always denied.
pub struct HeadlessHost;

#[async_trait]
impl NotificationHost for HeadlessHost {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    fn is_focused(&self) -> bool {
        true
    }

    fn show_alert(&self, _notification: &Notification) {}

    fn play_cue(&self) {}
}

type NotificationList = Arc<Mutex<Vec<Notification>>>;

pub struct NotificationDispatcher {
    session_user: UserId,
    host: Arc<dyn NotificationHost>,
    ttl: Duration,
    sound_enabled: AtomicBool,
    permission: Mutex<Option<NotificationPermission>>,
    active: NotificationList,
    events: broadcast::Sender<ClientEvent>,
}

impl NotificationDispatcher {
    pub fn new(
        session_user: UserId,
        host: Arc<dyn NotificationHost>,
        ttl: Duration,
        sound_enabled: bool,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            session_user,
            host,
            ttl,
            sound_enabled: AtomicBool::new(sound_enabled),
            permission: Mutex::new(None),
            active: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    /// Resolves the alert permission, asking the host at most once for the
    /// lifetime of this dispatcher.
    pub async fn ensure_permission(&self) -> NotificationPermission {
        let mut cached = self.permission.lock().await;
        if let Some(permission) = *cached {
            return permission;
        }
        let permission = match self.host.permission() {
            NotificationPermission::Default => self.host.request_permission().await,
            settled => settled,
        };
        info!(?permission, "notifications: alert permission resolved");
        *cached = Some(permission);
        permission
    }

    pub fn set_sound_enabled(&self, enabled: bool) {
        self.sound_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn sound_enabled(&self) -> bool {
        self.sound_enabled.load(Ordering::Relaxed)
    }

    pub async fn active(&self) -> Vec<Notification> {
        self.active.lock().await.clone()
    }

    /// The newest few notifications, oldest first.
    pub async fn toasts(&self) -> Vec<Notification> {
        let active = self.active.lock().await;
        let start = active.len().saturating_sub(VISIBLE_TOASTS);
        active[start..].to_vec()
    }

    pub async fn unread_count(&self) -> usize {
        self.active
            .lock()
            .await
            .iter()
            .filter(|notification| !notification.read)
            .count()
    }

    /// Same removal path as TTL expiry. Returns `false` if the
    /// notification was already gone.
    pub async fn dismiss(&self, id: &NotificationId) -> bool {
        remove(&self.active, &self.events, id).await
    }

    pub async fn mark_read(&self, id: &NotificationId) -> bool {
        let mut active = self.active.lock().await;
        match active.iter_mut().find(|notification| &notification.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub async fn mark_all_read(&self) {
        for notification in self.active.lock().await.iter_mut() {
            notification.read = true;
        }
    }

    pub async fn clear(&self) {
        let removed = std::mem::take(&mut *self.active.lock().await);
        for notification in removed {
            let _ = self
                .events
                .send(ClientEvent::NotificationRemoved(notification.id));
        }
    }

    async fn raise(&self, notification: Notification) {
        self.active.lock().await.push(notification.clone());
        let _ = self
            .events
            .send(ClientEvent::NotificationRaised(notification.clone()));

        let permission = match *self.permission.lock().await {
            Some(permission) => permission,
            None => self.host.permission(),
        };
        if permission == NotificationPermission::Granted && !self.host.is_focused() {
            self.host.show_alert(&notification);
        }
        if self.sound_enabled() {
            self.host.play_cue();
        }

        let active = Arc::clone(&self.active);
        let events = self.events.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if remove(&active, &events, &notification.id).await {
                debug!(id = %notification.id, "notifications: expired");
            }
        });
    }
}

async fn remove(
    active: &Mutex<Vec<Notification>>,
    events: &broadcast::Sender<ClientEvent>,
    id: &NotificationId,
) -> bool {
    let mut active = active.lock().await;
    let Some(index) = active.iter().position(|notification| &notification.id == id) else {
        return false;
    };
    active.remove(index);
    let _ = events.send(ClientEvent::NotificationRemoved(id.clone()));
    true
}

pub fn notification_for(message: &ChatMessage) -> Notification {
    Notification {
        id: NotificationId::generate(),
        kind: NotificationKind::Message,
        title: format!("New message from {}", sender_label(message)),
        content: message.content.clone(),
        timestamp: message.timestamp,
        read: false,
        room_id: Some(message.room_id.clone()),
        sender_id: Some(message.sender_id.clone()),
    }
}

#[async_trait]
impl SessionHandler for NotificationDispatcher {
    /// Every message from someone else is raised, whichever room it
    /// belongs to.
    async fn on_message(&self, message: &ChatMessage) {
        if message.sender_id == self.session_user {
            return;
        }
        self.raise(notification_for(message)).await;
    }
}
