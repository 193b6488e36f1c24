//! Room membership and presence for the sync engine.
//!
//! A client is a member of at most one workspace room. [`RoomSession`] is a
//! plain state machine: its methods return the [`ClientCommand`]s to send
//! and the engine wires them to the connection.
//!
//! # Room lifecycle
//!
//! 1. `join` while connected sends `join_room` and enters `Joining`
//! 2. `room_joined` from the hub makes the room `Active`
//! 3. A dropped connection moves an active room to `Rejoining`; it is not
//!    live again until the hub re-acknowledges it after reconnecting
//! 4. `leave` (or a join of another key) sends `leave_room` and clears
//!    presence
//!
//! Activity records expire a fixed time after the client received them.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use planner_proto::command::ClientCommand;
use planner_proto::event::ActivityPayload;
use planner_proto::task::{UserId, WorkspaceKey};

/// How long a peer's activity stays visible after it was received.
pub const DEFAULT_ACTIVITY_TTL: Duration = Duration::from_secs(30);

/// Maximum length of a workspace key in characters.
pub const MAX_KEY_LEN: usize = 64;

/// Errors that can occur during room operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    /// Workspace key is empty after sanitization.
    #[error("workspace key cannot be empty")]
    KeyEmpty,

    /// Workspace key exceeds the maximum allowed length.
    #[error("workspace key too long (max {MAX_KEY_LEN} characters)")]
    KeyTooLong,

    /// Joining requires a live connection.
    #[error("not connected")]
    NotConnected,

    /// The hub refused the join.
    #[error("join rejected: {0}")]
    Rejected(String),

    /// The connection dropped before the hub acknowledged the join.
    #[error("connection lost before the join was acknowledged")]
    Interrupted,

    /// Another join replaced this one before it completed.
    #[error("superseded by a join of {0}")]
    Superseded(WorkspaceKey),
}

/// Where the session stands with respect to its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomPhase {
    /// Not a member of any room.
    Idle,
    /// `join_room` sent, waiting for the hub.
    Joining(WorkspaceKey),
    /// Member; room events are live.
    Active(WorkspaceKey),
    /// Was a member before the connection dropped; waiting for a re-ack.
    Rejoining(WorkspaceKey),
}

/// A peer's most recent activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    /// Who is active.
    pub user: UserId,
    /// Kind of activity, e.g. `dragging`.
    pub activity_type: String,
    /// Activity details.
    pub payload: ActivityPayload,
    /// Timestamp the peer reported, ms since the UNIX epoch.
    pub reported_at_ms: u64,
    /// When this client received it, ms since the UNIX epoch.
    pub received_at_ms: u64,
    /// `received_at_ms` plus the TTL.
    pub expires_at_ms: u64,
}

/// Outcome of a `room_joined` acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    /// The room now active.
    pub room: WorkspaceKey,
    /// Whether this re-established membership after a reconnect.
    pub rejoined: bool,
}

/// Membership and presence state for one client.
#[derive(Debug)]
pub struct RoomSession {
    local_user: UserId,
    phase: RoomPhase,
    active_users: BTreeSet<UserId>,
    activity: HashMap<UserId, ActivityRecord>,
    activity_ttl_ms: u64,
}

impl RoomSession {
    /// Creates an idle session.
    #[must_use]
    pub fn new(local_user: UserId, activity_ttl: Duration) -> Self {
        Self {
            local_user,
            phase: RoomPhase::Idle,
            active_users: BTreeSet::new(),
            activity: HashMap::new(),
            activity_ttl_ms: u64::try_from(activity_ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> &RoomPhase {
        &self.phase
    }

    /// The room this session belongs to or is trying to belong to.
    #[must_use]
    pub const fn room(&self) -> Option<&WorkspaceKey> {
        match &self.phase {
            RoomPhase::Idle => None,
            RoomPhase::Joining(key) | RoomPhase::Active(key) | RoomPhase::Rejoining(key) => {
                Some(key)
            }
        }
    }

    /// Whether room events are live.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.phase, RoomPhase::Active(_))
    }

    /// The local viewer.
    #[must_use]
    pub const fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Request membership of `key`.
    ///
    /// Returns the commands to send: nothing if already joined or joining
    /// `key`, `join_room` from idle, or `leave_room` for the old room
    /// followed by `join_room` when switching.
    ///
    /// # Errors
    ///
    /// - [`RoomError::NotConnected`] if `connected` is false; no state changes.
    /// - [`RoomError::KeyEmpty`] / [`RoomError::KeyTooLong`] for a bad key.
    pub fn join(
        &mut self,
        key: &WorkspaceKey,
        connected: bool,
    ) -> Result<Vec<ClientCommand>, RoomError> {
        let key = validate_workspace_key(key.as_str()).map(WorkspaceKey::new)?;
        if !connected {
            return Err(RoomError::NotConnected);
        }
        if self.room() == Some(&key) {
            return Ok(Vec::new());
        }

        let mut commands = Vec::with_capacity(2);
        if let Some(old) = self.room() {
            commands.push(ClientCommand::LeaveRoom { room: old.clone() });
        }
        self.clear_presence();
        commands.push(ClientCommand::JoinRoom { room: key.clone() });
        tracing::debug!(room = %key, "joining room");
        self.phase = RoomPhase::Joining(key);
        Ok(commands)
    }

    /// Give up membership of `key`.
    ///
    /// Returns `leave_room` if `key` was the current room, `None` otherwise.
    pub fn leave(&mut self, key: &WorkspaceKey) -> Option<ClientCommand> {
        if self.room() != Some(key) {
            return None;
        }
        self.phase = RoomPhase::Idle;
        self.clear_presence();
        tracing::debug!(room = %key, "left room");
        Some(ClientCommand::LeaveRoom { room: key.clone() })
    }

    /// The connection came (back) up.
    ///
    /// Returns `join_room` for a room that has to be re-established.
    pub fn on_connected(&mut self) -> Option<ClientCommand> {
        match &self.phase {
            RoomPhase::Active(key) | RoomPhase::Rejoining(key) => {
                let key = key.clone();
                tracing::info!(room = %key, "rejoining room after reconnect");
                self.phase = RoomPhase::Rejoining(key.clone());
                Some(ClientCommand::JoinRoom { room: key })
            }
            RoomPhase::Idle | RoomPhase::Joining(_) => None,
        }
    }

    /// The connection dropped.
    ///
    /// An active room waits for a rejoin. A join still waiting for its
    /// acknowledgment is abandoned and its key returned.
    pub fn on_disconnected(&mut self) -> Option<WorkspaceKey> {
        self.clear_presence();
        match &self.phase {
            RoomPhase::Active(key) => {
                self.phase = RoomPhase::Rejoining(key.clone());
                None
            }
            RoomPhase::Joining(key) => {
                let key = key.clone();
                self.phase = RoomPhase::Idle;
                Some(key)
            }
            RoomPhase::Idle | RoomPhase::Rejoining(_) => None,
        }
    }

    /// Whether a frame tagged with `room` belongs to this session.
    ///
    /// Untagged frames are session-level and always accepted.
    #[must_use]
    pub fn accepts(&self, room: Option<&WorkspaceKey>) -> bool {
        room.is_none_or(|room| self.room() == Some(room))
    }

    /// The hub acknowledged the pending join.
    ///
    /// Returns `None` if no join was pending.
    pub fn on_room_joined(&mut self, active_users: Vec<UserId>) -> Option<JoinAck> {
        let (room, rejoined) = match &self.phase {
            RoomPhase::Joining(key) => (key.clone(), false),
            RoomPhase::Rejoining(key) => (key.clone(), true),
            RoomPhase::Idle | RoomPhase::Active(_) => return None,
        };
        self.active_users = active_users.into_iter().collect();
        self.phase = RoomPhase::Active(room.clone());
        Some(JoinAck { room, rejoined })
    }

    /// The hub refused the pending join. Returns the refused key.
    pub fn on_join_rejected(&mut self) -> Option<WorkspaceKey> {
        match &self.phase {
            RoomPhase::Joining(key) | RoomPhase::Rejoining(key) => {
                let key = key.clone();
                self.phase = RoomPhase::Idle;
                self.clear_presence();
                Some(key)
            }
            RoomPhase::Idle | RoomPhase::Active(_) => None,
        }
    }

    /// A viewer joined the room. Returns `true` if they were not known.
    pub fn on_user_joined(&mut self, user: UserId) -> bool {
        self.active_users.insert(user)
    }

    /// A viewer left the room. Their activity goes with them.
    pub fn on_user_left(&mut self, user: &UserId) -> bool {
        self.activity.remove(user);
        self.active_users.remove(user)
    }

    /// Record a peer's activity, replacing their previous one.
    ///
    /// Also sweeps expired records, so a burst of activity keeps the map
    /// bounded even without the periodic sweep.
    pub fn on_activity(
        &mut self,
        user: UserId,
        activity_type: String,
        payload: ActivityPayload,
        reported_at_ms: u64,
        now_ms: u64,
    ) -> &ActivityRecord {
        self.sweep(now_ms);
        self.active_users.insert(user.clone());
        let record = ActivityRecord {
            user: user.clone(),
            activity_type,
            payload,
            reported_at_ms,
            received_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(self.activity_ttl_ms),
        };
        self.activity.insert(user.clone(), record);
        &self.activity[&user]
    }

    /// Drop every activity record that expired at or before `now_ms`.
    ///
    /// Returns the users whose activity expired.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<UserId> {
        let mut expired: Vec<UserId> = self
            .activity
            .values()
            .filter(|record| record.expires_at_ms <= now_ms)
            .map(|record| record.user.clone())
            .collect();
        for user in &expired {
            self.activity.remove(user);
        }
        expired.sort();
        expired
    }

    /// The peer's current activity, if it has not expired by `now_ms`.
    #[must_use]
    pub fn activity_of(&self, user: &UserId, now_ms: u64) -> Option<&ActivityRecord> {
        self.activity
            .get(user)
            .filter(|record| record.expires_at_ms > now_ms)
    }

    /// All unexpired activity, ordered by user.
    #[must_use]
    pub fn activities(&self, now_ms: u64) -> Vec<&ActivityRecord> {
        let mut records: Vec<_> = self
            .activity
            .values()
            .filter(|record| record.expires_at_ms > now_ms)
            .collect();
        records.sort_by(|a, b| a.user.cmp(&b.user));
        records
    }

    /// Viewers currently in the room.
    #[must_use]
    pub const fn active_users(&self) -> &BTreeSet<UserId> {
        &self.active_users
    }

    /// Build an activity broadcast, or `None` when the room is not live.
    #[must_use]
    pub fn broadcast_activity(
        &self,
        activity_type: impl Into<String>,
        payload: ActivityPayload,
    ) -> Option<ClientCommand> {
        self.is_live().then(|| ClientCommand::BroadcastActivity {
            activity_type: activity_type.into(),
            payload,
        })
    }

    fn clear_presence(&mut self) {
        self.active_users.clear();
        self.activity.clear();
    }
}

/// Validate and sanitize a workspace key.
///
/// Strips control characters and trims surrounding whitespace.
///
/// # Errors
///
/// - [`RoomError::KeyEmpty`] if nothing is left after sanitization.
/// - [`RoomError::KeyTooLong`] if longer than [`MAX_KEY_LEN`] characters.
pub fn validate_workspace_key(key: &str) -> Result<String, RoomError> {
    let sanitized: String = key.chars().filter(|c| !c.is_control()).collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        return Err(RoomError::KeyEmpty);
    }
    if trimmed.chars().count() > MAX_KEY_LEN {
        return Err(RoomError::KeyTooLong);
    }
    Ok(trimmed.to_string())
}
