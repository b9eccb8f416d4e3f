//! Per-session fan-out on the relay server.
//!
//! Each session room holds the authoritative document and one tokio
//! broadcast channel. Frames are encoded once and shared as `Arc<str>`;
//! every connection task gets its own receiver and skips frames it sent.
//!
//! ```text
//! operation from A ──► room.apply() ──► document
//!                           │
//!                           └──► broadcast ──► B, C, …  (A skips its own)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hozo_core::{ApplyOutcome, OntologyDocument, Operation};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

use crate::presence::UserId;
use crate::protocol::{ProtocolError, ServerMessage, UserInfo};
use crate::session::SessionId;

/// What travels on a room's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// An encoded server frame. `from` is excluded from delivery.
    Frame { from: Option<UserId>, text: Arc<str> },
    /// The session was closed; connections must drop.
    Closed,
}

/// Statistics for monitoring a room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub operations_applied: u64,
    pub active_users: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    operations_applied: AtomicU64,
}

/// Why a user could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    Full,
    /// The room expired while the user was being admitted.
    Closed,
}

/// Members of a room and how long it has been empty.
struct Roster {
    users: HashMap<UserId, UserInfo>,
    vacated_at: Option<Instant>,
    closed: bool,
}

/// Returned to a newly admitted user.
pub struct Admission {
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
    pub document: OntologyDocument,
    pub users: Vec<UserInfo>,
}

/// One live session on the relay.
pub struct SessionRoom {
    id: SessionId,
    document: Mutex<OntologyDocument>,
    roster: RwLock<Roster>,
    sender: broadcast::Sender<Arc<Envelope>>,
    stats: AtomicBroadcastStats,
}

impl SessionRoom {
    pub fn new(id: SessionId, document: OntologyDocument, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            id,
            document: Mutex::new(document),
            roster: RwLock::new(Roster {
                users: HashMap::new(),
                vacated_at: Some(Instant::now()),
                closed: false,
            }),
            sender,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                operations_applied: AtomicU64::new(0),
            },
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Register `user` and hand back a receiver plus the current state.
    ///
    /// The document lock is held while subscribing, so every operation is
    /// either in the returned snapshot or delivered on the receiver, never
    /// both or neither.
    pub async fn admit(&self, user: UserInfo, max_users: usize) -> Result<Admission, AdmitError> {
        let document = self.document.lock().await;
        let mut roster = self.roster.write().await;
        if roster.closed {
            return Err(AdmitError::Closed);
        }
        if roster.users.len() >= max_users {
            return Err(AdmitError::Full);
        }
        roster.users.insert(user.user_id, user);
        roster.vacated_at = None;
        Ok(Admission {
            receiver: self.sender.subscribe(),
            document: document.clone(),
            users: roster.users.values().cloned().collect(),
        })
    }

    pub async fn remove_user(&self, user_id: &UserId) -> Option<UserInfo> {
        let mut roster = self.roster.write().await;
        let removed = roster.users.remove(user_id);
        if removed.is_some() && roster.users.is_empty() {
            roster.vacated_at = Some(Instant::now());
        }
        removed
    }

    /// How long the room has had no members. `None` while occupied.
    pub async fn idle_for(&self) -> Option<Duration> {
        let roster = self.roster.read().await;
        roster.vacated_at.map(|at| at.elapsed())
    }

    /// Close the room for admission if it has been empty for `ttl`.
    async fn retire_if_idle(&self, ttl: Duration) -> bool {
        let mut roster = self.roster.write().await;
        let expired = roster.users.is_empty()
            && roster.vacated_at.is_some_and(|at| at.elapsed() >= ttl);
        if expired {
            roster.closed = true;
        }
        expired
    }

    /// Apply `operation` to the room document and relay it to everyone
    /// but `from`.
    pub async fn apply(
        &self,
        from: UserId,
        operation: Operation,
    ) -> Result<ApplyOutcome, ProtocolError> {
        let mut document = self.document.lock().await;
        let outcome = hozo_core::apply(&mut document, &operation);
        self.stats.operations_applied.fetch_add(1, Ordering::Relaxed);
        // Ops on absent targets are relayed too; every replica no-ops them.
        self.broadcast(Some(from), &ServerMessage::Operation { operation })?;
        Ok(outcome)
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn broadcast(
        &self,
        from: Option<UserId>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let text: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.send(Envelope::Frame { from, text }))
    }

    /// Tell every connection the session is gone.
    pub fn close(&self) -> usize {
        self.send(Envelope::Closed)
    }

    fn send(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(Arc::new(envelope)).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn document(&self) -> OntologyDocument {
        self.document.lock().await.clone()
    }

    pub async fn user_count(&self) -> usize {
        self.roster.read().await.users.len()
    }

    pub async fn users(&self) -> Vec<UserInfo> {
        self.roster.read().await.users.values().cloned().collect()
    }

    pub async fn has_user(&self, user_id: &UserId) -> bool {
        self.roster.read().await.users.contains_key(user_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            operations_applied: self.stats.operations_applied.load(Ordering::Relaxed),
            active_users: self.roster.read().await.users.len(),
        }
    }
}

/// Session id → room.
pub struct SessionRegistry {
    rooms: RwLock<HashMap<SessionId, Arc<SessionRoom>>>,
    default_capacity: usize,
}

impl SessionRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<SessionRoom>> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Existing room for `id`, or a new one seeded with `document`.
    /// The flag is true when the room was created by this call.
    pub async fn get_or_create(
        &self,
        id: &SessionId,
        document: OntologyDocument,
    ) -> (Arc<SessionRoom>, bool) {
        // Fast path: read lock
        if let Some(room) = self.get(id).await {
            return (room, false);
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(id) {
            return (room.clone(), false);
        }

        let room = Arc::new(SessionRoom::new(id.clone(), document, self.default_capacity));
        rooms.insert(id.clone(), room.clone());
        log::info!("Created session {}", id);
        (room, true)
    }

    /// Remove a room. Its connections are told to drop.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<SessionRoom>> {
        let room = self.rooms.write().await.remove(id)?;
        room.close();
        log::info!("Closed session {}", id);
        Some(room)
    }

    /// Remove rooms that have had no members for at least `ttl`.
    pub async fn remove_idle(&self, ttl: Duration) -> Vec<SessionId> {
        let mut rooms = self.rooms.write().await;
        let mut expired = Vec::new();
        for (id, room) in rooms.iter() {
            if room.retire_if_idle(ttl).await {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            if let Some(room) = rooms.remove(id) {
                room.close();
            }
            log::info!("Expired idle session {}", id);
        }
        expired
    }

    pub async fn session_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
