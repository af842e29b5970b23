//! Best-effort member list for the active room.
//!
//! Sources are tried in order and the first non-empty one wins:
//! live presence from the backend, then the room's stored member ids, then
//! the session identity alone.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use shared::domain::{Member, Room, UserId};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{
    api::ChatApi,
    identity::{label_for_user_id, SessionIdentity},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceSource {
    Live,
    RoomMetadata,
    #[default]
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedMembers {
    pub members: Vec<Member>,
    pub source: PresenceSource,
}

pub struct PresenceResolver {
    identity: SessionIdentity,
    api: Arc<dyn ChatApi>,
    current: Mutex<ResolvedMembers>,
    /// Bumped by every room change; a result computed under an older value
    /// is stale.
    epoch: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
}

impl PresenceResolver {
    pub fn new(
        identity: SessionIdentity,
        api: Arc<dyn ChatApi>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            identity,
            api,
            current: Mutex::new(ResolvedMembers::default()),
            epoch: AtomicU64::new(0),
            events,
        }
    }

    pub async fn members(&self) -> ResolvedMembers {
        self.current.lock().await.clone()
    }

    /// Full resolution on room change; replaces the current list unless a
    /// later room change has already resolved.
    pub async fn resolve(&self, room: Option<&Room>) -> ResolvedMembers {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let resolved = match self.resolve_live_or_room(room).await {
            Some(resolved) => resolved,
            None => self.fallback(),
        };
        self.publish(resolved, epoch).await
    }

    /// Periodic re-resolution. An empty result leaves a non-empty list in
    /// place, and a result for a room that is no longer active is dropped.
    pub async fn refresh(&self, room: Option<&Room>) -> ResolvedMembers {
        self.refresh_since(self.room_epoch(), room).await
    }

    /// Current room-change counter. Read it before looking up the room to
    /// refresh, so a switch in between marks the refresh stale.
    pub fn room_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn refresh_since(&self, epoch: u64, room: Option<&Room>) -> ResolvedMembers {
        if let Some(resolved) = self.resolve_live_or_room(room).await {
            return self.publish(resolved, epoch).await;
        }
        let current = self.members().await;
        if !current.members.is_empty() {
            debug!("presence: empty refresh, keeping previous members");
            return current;
        }
        let resolved = self.fallback();
        self.publish(resolved, epoch).await
    }

    async fn resolve_live_or_room(&self, room: Option<&Room>) -> Option<ResolvedMembers> {
        match self.api.online_users().await {
            Ok(online) => {
                let members = live_members(&self.identity, &online, room);
                if !members.is_empty() {
                    return Some(ResolvedMembers {
                        members,
                        source: PresenceSource::Live,
                    });
                }
            }
            Err(err) => warn!("presence: live presence unavailable: {err}"),
        }

        let members = room
            .map(|room| members_from_room(&self.identity, room))
            .unwrap_or_default();
        (!members.is_empty()).then_some(ResolvedMembers {
            members,
            source: PresenceSource::RoomMetadata,
        })
    }

    fn fallback(&self) -> ResolvedMembers {
        ResolvedMembers {
            members: vec![self_member(&self.identity)],
            source: PresenceSource::Fallback,
        }
    }

    /// Returns the list in effect afterwards.
    async fn publish(&self, resolved: ResolvedMembers, epoch: u64) -> ResolvedMembers {
        let mut current = self.current.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("presence: dropping members resolved for a previous room");
            return current.clone();
        }
        if *current == resolved {
            return resolved;
        }
        debug!(
            source = ?resolved.source,
            count = resolved.members.len(),
            "presence: members resolved"
        );
        *current = resolved.clone();
        let _ = self.events.send(ClientEvent::MembersResolved(resolved.clone()));
        resolved
    }
}

fn self_member(identity: &SessionIdentity) -> Member {
    Member {
        user_id: identity.user_id.clone(),
        display_name: identity.display_name.clone(),
        is_online: true,
    }
}

/// Online users, narrowed to the room's members when the room lists any.
pub fn live_members(
    identity: &SessionIdentity,
    online: &[UserId],
    room: Option<&Room>,
) -> Vec<Member> {
    let room_members = room.map(|room| room.member_ids.as_slice()).unwrap_or(&[]);
    let mut members: Vec<Member> = Vec::new();
    for user_id in online {
        if !room_members.is_empty() && !room_members.contains(user_id) {
            continue;
        }
        if members.iter().any(|member| &member.user_id == user_id) {
            continue;
        }
        let display_name = if *user_id == identity.user_id {
            identity.display_name.clone()
        } else {
            label_for_user_id(user_id)
        };
        members.push(Member {
            user_id: user_id.clone(),
            display_name,
            is_online: true,
        });
    }
    members
}

/// Placeholder entries named `User {n}` in stored order. The session
/// identity is always present and goes first when the room omits it.
pub fn members_from_room(identity: &SessionIdentity, room: &Room) -> Vec<Member> {
    if room.member_ids.is_empty() {
        return Vec::new();
    }
    let mut members: Vec<Member> = room
        .member_ids
        .iter()
        .enumerate()
        .map(|(index, user_id)| {
            if *user_id == identity.user_id {
                self_member(identity)
            } else {
                Member {
                    user_id: user_id.clone(),
                    display_name: format!("User {}", index + 1),
                    is_online: false,
                }
            }
        })
        .collect();
    if !members
        .iter()
        .any(|member| member.user_id == identity.user_id)
    {
        members.insert(0, self_member(identity));
    }
    members
}
