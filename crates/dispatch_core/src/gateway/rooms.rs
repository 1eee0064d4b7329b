//! Trip rooms: named groups of sessions that receive a trip's live location.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::protocol::ServerEvent;

pub type SessionId = u64;

/// Outbound side of one authenticated session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub worker_id: String,
    outbound: mpsc::Sender<ServerEvent>,
}

impl SessionHandle {
    pub fn new(id: SessionId, worker_id: String, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            worker_id,
            outbound,
        }
    }

    /// Queue an event without waiting. A full or closed queue drops it.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(session_id = self.id, "outbound queue full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Default)]
struct RoomsState {
    rooms: HashMap<String, HashMap<SessionId, SessionHandle>>,
    memberships: HashMap<SessionId, HashSet<String>>,
}

#[derive(Debug, Default)]
pub struct TripRooms {
    state: RwLock<RoomsState>,
}

impl TripRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the session was already a member.
    pub fn join(&self, room: &str, session: &SessionHandle) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let joined = state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(session.id, session.clone())
            .is_none();
        state
            .memberships
            .entry(session.id)
            .or_default()
            .insert(room.to_string());
        joined
    }

    pub fn leave(&self, room: &str, session_id: SessionId) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(rooms) = state.memberships.get_mut(&session_id) {
            rooms.remove(room);
            if rooms.is_empty() {
                state.memberships.remove(&session_id);
            }
        }
        remove_member(&mut state.rooms, room, session_id)
    }

    /// Drop a session from every room it joined. Returns how many it left.
    pub fn leave_all(&self, session_id: SessionId) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(rooms) = state.memberships.remove(&session_id) else {
            return 0;
        };
        rooms
            .iter()
            .filter(|room| remove_member(&mut state.rooms, room, session_id))
            .count()
    }

    pub fn member_count(&self, room: &str) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.rooms.get(room).map_or(0, HashMap::len)
    }

    /// Send `event` to every member of `room`, skipping sessions owned by
    /// `exclude_worker`. Returns how many sessions accepted it.
    pub fn broadcast(&self, room: &str, event: &ServerEvent, exclude_worker: Option<&str>) -> usize {
        let recipients: Vec<SessionHandle> = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let Some(members) = state.rooms.get(room) else {
                return 0;
            };
            members
                .values()
                .filter(|session| Some(session.worker_id.as_str()) != exclude_worker)
                .cloned()
                .collect()
        };
        recipients
            .iter()
            .filter(|session| session.send(event.clone()))
            .count()
    }
}

fn remove_member(
    rooms: &mut HashMap<String, HashMap<SessionId, SessionHandle>>,
    room: &str,
    session_id: SessionId,
) -> bool {
    let Some(members) = rooms.get_mut(room) else {
        return false;
    };
    let removed = members.remove(&session_id).is_some();
    if members.is_empty() {
        rooms.remove(room);
    }
    removed
}
