//! Room membership for the hub.
//!
//! A room is a workspace key plus the sessions currently viewing it. A
//! session is in at most one room; joining another room leaves the first.
//! Presence is per user: a user with two sessions in a room is announced
//! once and leaves only when the last session does.
//!
//! Rooms are ephemeral and disappear with their last member.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;

use planner_proto::task::{UserId, WorkspaceKey};

/// Maximum number of sessions in one room.
pub const MAX_ROOM_MEMBERS: usize = 256;

/// Maximum length of a room key.
pub const MAX_ROOM_KEY_LEN: usize = 64;

/// Identifies one WebSocket session on the hub.
pub type SessionId = u64;

/// Errors that can occur when joining a room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// The key is empty or too long.
    #[error("invalid room key (must be 1..={MAX_ROOM_KEY_LEN} characters)")]
    InvalidKey,
    /// The room has reached its member limit.
    #[error("room is full (max {MAX_ROOM_MEMBERS} members)")]
    Full,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    /// Room the session left to join this one, if any.
    pub left: Option<Departure>,
    /// Viewers now in the room, including the joiner.
    pub active_users: Vec<UserId>,
    /// Whether the user was not already present through another session.
    pub newly_present: bool,
}

/// A session leaving a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// The room left.
    pub room: WorkspaceKey,
    /// Whose session it was.
    pub user: UserId,
    /// Whether the user has no session left in the room.
    pub gone: bool,
}

#[derive(Debug, Default)]
struct Registry {
    rooms: HashMap<WorkspaceKey, HashMap<SessionId, UserId>>,
    sessions: HashMap<SessionId, WorkspaceKey>,
}

impl Registry {
    fn remove(&mut self, session: SessionId) -> Option<Departure> {
        let room = self.sessions.remove(&session)?;
        let members = self.rooms.get_mut(&room)?;
        let user = members.remove(&session)?;
        let gone = !members.values().any(|u| *u == user);
        if members.is_empty() {
            self.rooms.remove(&room);
        }
        Some(Departure { room, user, gone })
    }
}

/// In-memory room directory.
///
/// Thread-safe via [`RwLock`].
pub struct RoomRegistry {
    inner: RwLock<Registry>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }

    /// Add `session` to `room` as `user`.
    ///
    /// Joining the room the session is already in is a no-op that reports
    /// the current viewers.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::InvalidKey`] or [`RoomError::Full`]; the
    /// session's current membership is left untouched.
    pub async fn join(
        &self,
        room: &WorkspaceKey,
        session: SessionId,
        user: &UserId,
    ) -> Result<Joined, RoomError> {
        let len = room.as_str().trim().chars().count();
        if len == 0 || len > MAX_ROOM_KEY_LEN {
            return Err(RoomError::InvalidKey);
        }

        let mut inner = self.inner.write().await;
        let already_here = inner.sessions.get(&session) == Some(room);
        if !already_here
            && inner
                .rooms
                .get(room)
                .is_some_and(|m| m.len() >= MAX_ROOM_MEMBERS)
        {
            return Err(RoomError::Full);
        }

        let left = if already_here {
            None
        } else {
            inner.remove(session)
        };
        let members = inner.rooms.entry(room.clone()).or_default();
        let newly_present = !members.values().any(|u| u == user);
        members.insert(session, user.clone());
        let active_users = sorted_users(members);
        inner.sessions.insert(session, room.clone());
        drop(inner);

        Ok(Joined {
            left,
            active_users,
            newly_present: newly_present && !already_here,
        })
    }

    /// Remove `session` from `room` if it is there.
    pub async fn leave(&self, room: &WorkspaceKey, session: SessionId) -> Option<Departure> {
        let mut inner = self.inner.write().await;
        if inner.sessions.get(&session) != Some(room) {
            return None;
        }
        inner.remove(session)
    }

    /// Remove `session` from whatever room it is in.
    pub async fn disconnect(&self, session: SessionId) -> Option<Departure> {
        self.inner.write().await.remove(session)
    }

    /// The room `session` is in.
    pub async fn room_of(&self, session: SessionId) -> Option<WorkspaceKey> {
        self.inner.read().await.sessions.get(&session).cloned()
    }

    /// Sessions in `room`.
    pub async fn members(&self, room: &WorkspaceKey) -> Vec<SessionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct users in `room`, sorted.
    pub async fn active_users(&self, room: &WorkspaceKey) -> Vec<UserId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .map(sorted_users)
            .unwrap_or_default()
    }
}

fn sorted_users(members: &HashMap<SessionId, UserId>) -> Vec<UserId> {
    members
        .values()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
