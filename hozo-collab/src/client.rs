//! Session client: the single owner of one user's view of a session.
//!
//! Provides:
//! - Session lifecycle (open, create, join, leave) over any [`Transport`]
//! - Local-first edits through the shared applier
//! - Remote operations and snapshots merged into the local document
//! - The presence table and local cursor reporting
//! - Reconnection with a fixed delay and an unsent queue for edits made
//!   while disconnected
//!
//! ```text
//! Idle ─► AwaitingUsername ─► Connecting ─► Joined ⇄ Disconnected ⇄ Reconnecting
//!                                  │           │                         │
//!                                  └───────────┴────────► Left ◄─────────┘
//! ```
//!
//! The client is driven by its owner: call [`SessionClient::process_next`]
//! (or [`SessionClient::run`]) to consume transport events and timers.
//! Nothing mutates client state behind the owner's back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hozo_core::{apply, ApplyOutcome, OntologyDocument, Operation, Point};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::presence::{PresenceEvent, PresenceTable, PresenceUpdate, UserId, UserPresence};
use crate::reconnect::ReconnectionSupervisor;
use crate::session::SessionId;
use crate::subscription::{EventHub, Subscription};
use crate::transport::{
    DocumentChange, JoinAccepted, JoinError, JoinRequest, LinkEvent, Transport,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session chosen.
    Idle,
    /// Session id known, waiting for a user name.
    AwaitingUsername,
    /// First join in flight.
    Connecting,
    /// Document and presence are live.
    Joined,
    /// Transport lost; edits are queued.
    Disconnected,
    /// Waiting for or running a rejoin.
    Reconnecting,
    /// Session released. Terminal for this session.
    Left,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::AwaitingUsername => "awaiting-username",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Joined => "joined",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Left => "left",
        }
    }

    /// States in which the client holds a session document.
    pub fn has_document(&self) -> bool {
        matches!(
            self,
            ConnectionState::Joined | ConnectionState::Disconnected | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the session client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The local document may have changed.
    DocumentChanged,
    /// The presence table changed.
    PresenceChanged,
    /// A remote user entered the session.
    UserJoined(UserPresence),
    /// A remote user left the session.
    UserLeft(UserPresence),
    ConnectionStateChanged(ConnectionState),
    /// A join was refused for good.
    JoinFailed(JoinError),
    /// Number of operations waiting to be sent.
    PendingChanged(usize),
}

/// Session client configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay before each rejoin attempt.
    pub reconnect_delay: Duration,
    /// Minimum spacing of published cursor updates. Zero sends every move.
    pub cursor_interval: Duration,
    /// Capacity of the unsent queue.
    pub max_unsent: usize,
    /// Re-apply and re-send queued edits after a rejoin instead of dropping
    /// them.
    pub replay_unsent_on_rejoin: bool,
    /// Name used when the user leaves theirs blank.
    pub anonymous_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            cursor_interval: Duration::ZERO,
            max_unsent: 10_000,
            replay_unsent_on_rejoin: true,
            anonymous_name: "Anonymous".to_string(),
        }
    }
}

/// Session client errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("not joined to a session (state: {0})")]
    NotJoined(ConnectionState),
    #[error("a session is already open (state: {0})")]
    SessionActive(ConnectionState),
    #[error("unsent queue is full ({0} operations)")]
    UnsentQueueFull(usize),
}

// ───────────────────────────────────────────────────────────────────
// Unsent queue
// ───────────────────────────────────────────────────────────────────

/// Offline queue for edits made while disconnected.
///
/// Queued operations are replayed on rejoin.
pub struct OfflineQueue {
    queue: VecDeque<QueuedOperation>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedOperation {
    operation: Operation,
    queued_at: Instant,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation for later replay. False when full.
    pub fn enqueue(&mut self, operation: Operation) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(QueuedOperation {
            operation,
            queued_at: Instant::now(),
        });
        true
    }

    /// Drain all queued operations, oldest first.
    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).map(|q| q.operation).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// How long the oldest operation has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }
}

// ───────────────────────────────────────────────────────────────────
// Listeners
// ───────────────────────────────────────────────────────────────────

pub type ListenerId = u64;

type DocumentListener = Box<dyn FnMut(&OntologyDocument) + Send>;
type PresenceListener = Box<dyn FnMut(&PresenceTable) + Send>;
type StateListener = Box<dyn FnMut(ConnectionState) + Send>;

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    document: Vec<(ListenerId, DocumentListener)>,
    presence: Vec<(ListenerId, PresenceListener)>,
    state: Vec<(ListenerId, StateListener)>,
}

impl Listeners {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        self.next_id
    }
}

struct PendingJoin {
    epoch: u64,
    rejoin: bool,
    rx: oneshot::Receiver<Result<JoinAccepted, JoinError>>,
}

// ───────────────────────────────────────────────────────────────────
// Session client
// ───────────────────────────────────────────────────────────────────

/// One user's live view of a shared session.
pub struct SessionClient {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: ConnectionState,

    session_id: Option<SessionId>,
    user_name: Option<String>,
    /// Document to create the session from, until a join succeeds.
    seed: Option<OntologyDocument>,
    local_user_id: Option<UserId>,
    local_color: Option<String>,
    document: Option<OntologyDocument>,
    presence: PresenceTable,
    last_cursor: Option<Point>,

    unsent: OfflineQueue,
    supervisor: ReconnectionSupervisor,

    /// Bumped by every join attempt and by `leave`; stale results are dropped.
    join_epoch: u64,
    pending_join: Option<PendingJoin>,
    held_changes: Vec<DocumentChange>,
    held_presence: Vec<PresenceEvent>,
    lost_during_join: Option<String>,

    document_rx: Subscription<DocumentChange>,
    presence_rx: Subscription<PresenceEvent>,
    link_rx: Subscription<LinkEvent>,

    events: EventHub<SessionEvent>,
    listeners: Listeners,
}

impl SessionClient {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let document_rx = transport.subscribe_document_changes();
        let presence_rx = transport.subscribe_presence();
        let link_rx = transport.subscribe_link();
        Self {
            presence: PresenceTable::with_interval(config.cursor_interval),
            unsent: OfflineQueue::new(config.max_unsent),
            supervisor: ReconnectionSupervisor::new(config.reconnect_delay),
            transport,
            config,
            state: ConnectionState::Idle,
            session_id: None,
            user_name: None,
            seed: None,
            local_user_id: None,
            local_color: None,
            document: None,
            last_cursor: None,
            join_epoch: 0,
            pending_join: None,
            held_changes: Vec::new(),
            held_presence: Vec::new(),
            lost_during_join: None,
            document_rx,
            presence_rx,
            link_rx,
            events: EventHub::new(),
            listeners: Listeners::default(),
        }
    }

    pub fn with_defaults(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, SessionConfig::default())
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        self.local_user_id
    }

    pub fn local_color(&self) -> Option<&str> {
        self.local_color.as_deref()
    }

    /// The local document, once a session has been joined.
    pub fn document(&self) -> Option<&OntologyDocument> {
        self.document.as_ref()
    }

    pub fn presence(&self) -> &PresenceTable {
        &self.presence
    }

    /// Operations applied locally but not yet handed to the transport.
    pub fn pending_count(&self) -> usize {
        self.unsent.len()
    }

    /// Shareable link for the current session.
    pub fn share_url(&self, base: &str) -> Option<String> {
        self.session_id.as_ref().map(|id| id.share_url(base))
    }

    // ─── Signals ─────────────────────────────────────────────────

    /// Stream of every [`SessionEvent`].
    pub fn events(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    pub fn on_document_changed<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&OntologyDocument) + Send + 'static,
    {
        let id = self.listeners.next_id();
        self.listeners.document.push((id, Box::new(listener)));
        id
    }

    pub fn on_presence_changed<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&PresenceTable) + Send + 'static,
    {
        let id = self.listeners.next_id();
        self.listeners.presence.push((id, Box::new(listener)));
        id
    }

    pub fn on_connection_state_changed<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        let id = self.listeners.next_id();
        self.listeners.state.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listener_count();
        self.listeners.document.retain(|(l, _)| *l != id);
        self.listeners.presence.retain(|(l, _)| *l != id);
        self.listeners.state.retain(|(l, _)| *l != id);
        self.listener_count() != before
    }

    fn listener_count(&self) -> usize {
        self.listeners.document.len() + self.listeners.presence.len() + self.listeners.state.len()
    }

    // ─── Session selection ───────────────────────────────────────

    /// Choose the session to join. Joins right away when the user name is
    /// already known.
    pub fn open_session(&mut self, session_id: SessionId) -> Result<(), SessionError> {
        self.select_session(session_id, None)
    }

    /// Open the session named by the `session` query parameter of `url`.
    /// Returns `None` (and stays put) when the URL names none.
    pub fn open_from_url(&mut self, url: &str) -> Result<Option<SessionId>, SessionError> {
        match SessionId::from_url(url) {
            Some(id) => {
                self.open_session(id.clone())?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Start a new session seeded with `document` under a fresh id.
    pub fn create_session(
        &mut self,
        mut document: OntologyDocument,
    ) -> Result<SessionId, SessionError> {
        document.normalize_links();
        let id = SessionId::generate();
        self.select_session(id.clone(), Some(document))?;
        Ok(id)
    }

    /// Set the display name. A blank name becomes the anonymous name.
    /// Starts the join when a session is waiting for it.
    pub fn set_user_name(&mut self, name: &str) {
        let name = match name.trim() {
            "" => self.config.anonymous_name.clone(),
            name => name.to_string(),
        };
        self.user_name = Some(name);
        if self.state == ConnectionState::AwaitingUsername {
            self.start_join(false);
        }
    }

    fn select_session(
        &mut self,
        session_id: SessionId,
        seed: Option<OntologyDocument>,
    ) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::AwaitingUsername | ConnectionState::Left => {}
            state => return Err(SessionError::SessionActive(state)),
        }
        if self.state == ConnectionState::Left {
            self.supervisor = ReconnectionSupervisor::new(self.config.reconnect_delay);
            self.document = None;
            self.local_user_id = None;
            self.local_color = None;
        }

        log::info!("Opening session {}", session_id);
        self.session_id = Some(session_id);
        self.seed = seed;
        self.set_state(ConnectionState::AwaitingUsername);
        if self.user_name.is_some() {
            self.start_join(false);
        }
        Ok(())
    }

    // ─── Driving ─────────────────────────────────────────────────

    /// Wait for the next inbound event (join result, remote change,
    /// presence, link loss, retry timer) and handle it.
    ///
    /// Returns false once the client has left.
    pub async fn process_next(&mut self) -> bool {
        if self.state == ConnectionState::Left {
            return false;
        }

        tokio::select! {
            biased;

            (epoch, rejoin, result) = next_join_result(&mut self.pending_join) => {
                self.pending_join = None;
                self.on_join_result(epoch, rejoin, result).await;
            }
            Some(change) = self.document_rx.recv() => self.on_document_change(change),
            Some(event) = self.presence_rx.recv() => self.on_presence_event(event),
            Some(event) = self.link_rx.recv() => self.on_link_event(event),
            attempt = self.supervisor.wait() => {
                log::info!("Rejoin attempt {} for session {:?}", attempt, self.session_id);
                self.start_join(true);
            }
            else => return false,
        }

        self.state != ConnectionState::Left
    }

    /// Process events until the client leaves.
    pub async fn run(&mut self) {
        while self.process_next().await {}
    }

    // ─── Local actions ───────────────────────────────────────────

    /// Apply `operation` locally, then forward it.
    ///
    /// The local document reflects the operation when this returns. While
    /// disconnected the operation is queued and sent after the rejoin.
    pub async fn submit(&mut self, operation: Operation) -> Result<ApplyOutcome, SessionError> {
        if !self.state.has_document() {
            return Err(SessionError::NotJoined(self.state));
        }
        let online = self.state == ConnectionState::Joined;
        if !online && self.unsent.is_full() {
            return Err(SessionError::UnsentQueueFull(self.unsent.len()));
        }

        let Some(document) = self.document.as_mut() else {
            return Err(SessionError::NotJoined(self.state));
        };
        let outcome = apply(document, &operation);
        if outcome.changed() {
            self.notify_document();
        }

        if online {
            let sent = match self.document.as_ref() {
                Some(document) => self.transport.submit_operation(&operation, document).await,
                None => Ok(()),
            };
            if let Err(e) = sent {
                log::warn!("Queueing {} after send failure: {}", operation.kind(), e);
                self.enqueue_unsent(operation);
            }
        } else {
            self.enqueue_unsent(operation);
        }
        Ok(outcome)
    }

    /// Report the local pointer position. Best effort; dropped when not
    /// joined or throttled.
    pub async fn report_cursor(&mut self, point: Point) {
        self.last_cursor = Some(point);
        if self.state != ConnectionState::Joined {
            return;
        }
        if let Some(point) = self.presence.update_local_cursor(point) {
            if let Err(e) = self
                .transport
                .publish_presence(PresenceUpdate::Cursor(point))
                .await
            {
                log::trace!("Cursor update dropped: {}", e);
            }
        }
    }

    /// Release the session. Idempotent. Suppresses a join still in flight
    /// and stops reconnection for good.
    pub async fn leave(&mut self) {
        if self.state == ConnectionState::Left {
            return;
        }
        let had_transport = !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::AwaitingUsername
        );

        self.join_epoch += 1;
        self.pending_join = None;
        self.supervisor.cancel();
        self.held_changes.clear();
        self.held_presence.clear();
        self.lost_during_join = None;

        if had_transport {
            if self.state == ConnectionState::Joined {
                if let Err(e) = self.transport.publish_presence(PresenceUpdate::Leave).await {
                    log::trace!("Leave presence dropped: {}", e);
                }
            }
            if let Err(e) = self.transport.leave().await {
                log::warn!("Transport leave failed: {}", e);
            }
        }

        if !self.unsent.is_empty() {
            log::warn!("Leaving with {} unsent operations", self.unsent.len());
            self.unsent.clear();
            self.events.emit(SessionEvent::PendingChanged(0));
        }
        if !self.presence.is_empty() {
            self.presence.clear();
            self.notify_presence();
        }

        log::info!("Left session {:?}", self.session_id);
        self.set_state(ConnectionState::Left);
    }

    // ─── Joining ─────────────────────────────────────────────────

    fn start_join(&mut self, rejoin: bool) {
        let (Some(session_id), Some(user_name)) = (self.session_id.clone(), self.user_name.clone())
        else {
            return;
        };

        self.join_epoch += 1;
        self.held_changes.clear();
        self.held_presence.clear();
        self.lost_during_join = None;

        let request = JoinRequest {
            session_id,
            user_name,
            seed: self.seed.clone(),
        };
        // Taken before spawning so a `leave` right after defeats the join.
        let ticket = self.transport.begin_join();
        let transport = self.transport.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(transport.join(ticket, request).await);
        });
        self.pending_join = Some(PendingJoin {
            epoch: self.join_epoch,
            rejoin,
            rx,
        });

        self.set_state(if rejoin {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });
    }

    async fn on_join_result(
        &mut self,
        epoch: u64,
        rejoin: bool,
        result: Result<JoinAccepted, JoinError>,
    ) {
        if epoch != self.join_epoch || self.state == ConnectionState::Left {
            log::debug!("Discarding stale join result (epoch {})", epoch);
            return;
        }

        match result {
            Ok(accepted) => self.on_joined(accepted).await,
            Err(err) if err.is_retryable() => {
                log::warn!("Join of {:?} failed: {}", self.session_id, err);
                self.lost_during_join = None;
                if !rejoin {
                    self.set_state(ConnectionState::Disconnected);
                }
                self.schedule_retry();
            }
            Err(err) => {
                log::warn!("Join of {:?} refused: {}", self.session_id, err);
                self.events.emit(SessionEvent::JoinFailed(err));
                if rejoin {
                    // The session is gone.
                    self.leave().await;
                } else {
                    self.session_id = None;
                    self.seed = None;
                    self.set_state(ConnectionState::Idle);
                }
            }
        }
    }

    async fn on_joined(&mut self, accepted: JoinAccepted) {
        let user_id = accepted.local_user_id;
        let name = accepted
            .users
            .iter()
            .find(|u| u.user_id == user_id)
            .map(|u| u.name.clone())
            .or_else(|| self.user_name.clone())
            .unwrap_or_else(|| self.config.anonymous_name.clone());
        let local = UserPresence::new(user_id, name, accepted.color.clone());

        self.seed = None;
        self.local_user_id = Some(user_id);
        self.local_color = Some(accepted.color);
        self.presence.reset(
            local,
            accepted.users.into_iter().filter(|u| u.user_id != user_id),
        );
        for event in std::mem::take(&mut self.held_presence) {
            self.presence.handle_event(&event);
        }

        let mut document = accepted.document;
        for change in std::mem::take(&mut self.held_changes) {
            if self.transport.accept_change(&change) {
                apply_change(&mut document, change);
            }
        }
        self.document = Some(document);
        self.supervisor.reset();

        log::info!(
            "Joined session {:?} as {} ({} users)",
            self.session_id,
            user_id,
            self.presence.len()
        );
        self.set_state(ConnectionState::Joined);
        self.replay_unsent().await;
        self.notify_document();
        self.notify_presence();

        if let Some(cursor) = self.last_cursor {
            self.report_cursor(cursor).await;
        }
        if let Some(reason) = self.lost_during_join.take() {
            self.on_link_lost(reason);
        }
    }

    async fn replay_unsent(&mut self) {
        if self.unsent.is_empty() {
            return;
        }
        let age = self.unsent.oldest_age().unwrap_or_default();
        let queued = self.unsent.drain();

        if !self.config.replay_unsent_on_rejoin {
            log::warn!("Discarding {} unsent operations after rejoin", queued.len());
            self.events.emit(SessionEvent::PendingChanged(0));
            return;
        }

        log::info!(
            "Replaying {} unsent operations (oldest queued {:?} ago)",
            queued.len(),
            age
        );
        let Some(document) = self.document.as_mut() else {
            return;
        };
        for operation in &queued {
            apply(document, operation);
        }

        let mut remaining = queued.into_iter();
        while let Some(operation) = remaining.next() {
            let sent = match self.document.as_ref() {
                Some(document) => self.transport.submit_operation(&operation, document).await,
                None => Ok(()),
            };
            if let Err(e) = sent {
                log::warn!("Replay interrupted: {}", e);
                self.unsent.enqueue(operation);
                for operation in remaining.by_ref() {
                    self.unsent.enqueue(operation);
                }
                break;
            }
        }
        self.events.emit(SessionEvent::PendingChanged(self.unsent.len()));
    }

    fn schedule_retry(&mut self) {
        if self.supervisor.schedule() {
            log::info!(
                "Rejoining {:?} in {:?}",
                self.session_id,
                self.supervisor.delay()
            );
            self.set_state(ConnectionState::Reconnecting);
        }
    }

    // ─── Inbound ─────────────────────────────────────────────────

    fn on_document_change(&mut self, change: DocumentChange) {
        if self.pending_join.is_some() {
            self.held_changes.push(change);
            return;
        }
        if !self.transport.accept_change(&change) {
            return;
        }
        let changed = match self.document.as_mut() {
            Some(document) if self.state.has_document() => apply_change(document, change),
            _ => {
                log::debug!("Ignoring document change in state {}", self.state);
                false
            }
        };
        if changed {
            self.notify_document();
        }
    }

    fn on_presence_event(&mut self, event: PresenceEvent) {
        if self.pending_join.is_some() {
            self.held_presence.push(event);
            return;
        }
        if self.state != ConnectionState::Joined {
            log::trace!("Ignoring presence in state {}", self.state);
            return;
        }
        let change = self.presence.apply_event(&event);
        if change.changed {
            self.notify_presence();
        }
        for user in change.joined {
            log::info!("{} joined the session", user.name);
            self.events.emit(SessionEvent::UserJoined(user));
        }
        for user in change.left {
            log::info!("{} left the session", user.name);
            self.events.emit(SessionEvent::UserLeft(user));
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let LinkEvent::Lost { reason } = event;
        if self.pending_join.is_some() {
            self.lost_during_join = Some(reason);
            return;
        }
        match self.state {
            ConnectionState::Joined => self.on_link_lost(reason),
            state => log::debug!("Ignoring link loss in state {}: {}", state, reason),
        }
    }

    fn on_link_lost(&mut self, reason: String) {
        log::warn!("Lost session {:?}: {}", self.session_id, reason);
        self.set_state(ConnectionState::Disconnected);
        self.schedule_retry();
    }

    // ─── Notification ────────────────────────────────────────────

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::debug!("Connection state {} -> {}", self.state, state);
        self.state = state;
        for (_, listener) in self.listeners.state.iter_mut() {
            listener(state);
        }
        self.events.emit(SessionEvent::ConnectionStateChanged(state));
    }

    fn notify_document(&mut self) {
        if let Some(document) = &self.document {
            for (_, listener) in self.listeners.document.iter_mut() {
                listener(document);
            }
        }
        self.events.emit(SessionEvent::DocumentChanged);
    }

    fn notify_presence(&mut self) {
        for (_, listener) in self.listeners.presence.iter_mut() {
            listener(&self.presence);
        }
        self.events.emit(SessionEvent::PresenceChanged);
    }

    fn enqueue_unsent(&mut self, operation: Operation) {
        if self.unsent.enqueue(operation) {
            self.events.emit(SessionEvent::PendingChanged(self.unsent.len()));
        } else {
            log::error!("Unsent queue full, dropping operation");
        }
    }
}

/// Apply a remote change. Returns whether the document changed.
fn apply_change(document: &mut OntologyDocument, change: DocumentChange) -> bool {
    match change {
        DocumentChange::Operation(operation) => apply(document, &operation).changed(),
        DocumentChange::Snapshot { document: snapshot, .. } => {
            if *document == snapshot {
                false
            } else {
                *document = snapshot;
                true
            }
        }
    }
}

async fn next_join_result(
    slot: &mut Option<PendingJoin>,
) -> (u64, bool, Result<JoinAccepted, JoinError>) {
    match slot {
        Some(pending) => {
            let result = (&mut pending.rx).await.unwrap_or_else(|_| {
                Err(JoinError::TransportUnavailable("join task ended".into()))
            });
            (pending.epoch, pending.rejoin, result)
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hozo_core::Concept;

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(Operation::delete_concept("a")));
        assert!(queue.enqueue(Operation::delete_concept("b")));
        assert!(!queue.enqueue(Operation::delete_concept("c")));
        assert!(queue.is_full());

        let drained = queue.drain();
        assert_eq!(drained[0], Operation::delete_concept("a"));
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.oldest_age().is_none());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::AwaitingUsername.to_string(), "awaiting-username");
        assert!(ConnectionState::Reconnecting.has_document());
        assert!(!ConnectionState::Connecting.has_document());
    }

    #[test]
    fn test_apply_change_snapshot_detects_no_op() {
        let mut doc = OntologyDocument::new("a.xml", "d");
        doc.concepts.push(Concept::new("1", "Animal", Point::ORIGIN));
        let same = doc.clone();
        assert!(!apply_change(&mut doc, DocumentChange::snapshot(same)));

        let mut other = doc.clone();
        other.concepts.clear();
        assert!(apply_change(&mut doc, DocumentChange::snapshot(other)));
        assert!(doc.concepts.is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.max_unsent, 10_000);
        assert!(config.replay_unsent_on_rejoin);
        assert_eq!(config.anonymous_name, "Anonymous");
    }
}
