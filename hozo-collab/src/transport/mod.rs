//! The seam between a session client and the network.
//!
//! A [`Transport`] joins sessions, forwards operations and presence, and
//! reports incoming changes through [`Subscription`]s. Two implementations
//! ship:
//!
//! - [`RelayTransport`] talks JSON over a WebSocket to a [`RelayServer`]
//!   that rebroadcasts each operation.
//! - [`ReplicatedDocTransport`] keeps the whole document in a
//!   [`SharedStore`] and relays snapshots.
//!
//! Subscriptions belong to the transport, not to a connection: they stay
//! valid across any number of joins.
//!
//! [`RelayServer`]: crate::server::RelayServer
//! [`SharedStore`]: crate::store::SharedStore

mod relay;
mod replicated;

pub use relay::{RelayConfig, RelayTransport};
pub use replicated::ReplicatedDocTransport;
pub use crate::store::WriteStamp;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hozo_core::{OntologyDocument, Operation};

use crate::presence::{PresenceEvent, PresenceUpdate, UserId, UserPresence};
use crate::protocol::ProtocolError;
use crate::session::SessionId;
use crate::store::StoreError;
use crate::subscription::Subscription;

/// What a client asks for when joining.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub user_name: String,
    /// Initial document. When present the session is created if missing.
    pub seed: Option<OntologyDocument>,
}

/// A successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAccepted {
    pub local_user_id: UserId,
    pub color: String,
    pub document: OntologyDocument,
    /// Everyone present at join time, possibly including the local user.
    pub users: Vec<UserPresence>,
}

/// Why a join failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JoinError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("join rejected: {0}")]
    Rejected(String),
}

impl JoinError {
    /// Whether trying again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JoinError::TransportUnavailable(_))
    }
}

/// Failures after a session is joined.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A remote change to the shared document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    /// Apply this operation.
    Operation(Operation),
    /// Replace the whole document. `stamp` names the write that produced
    /// it, when the transport knows.
    Snapshot {
        document: OntologyDocument,
        stamp: Option<WriteStamp>,
    },
}

impl DocumentChange {
    /// An unstamped snapshot.
    pub fn snapshot(document: OntologyDocument) -> Self {
        DocumentChange::Snapshot {
            document,
            stamp: None,
        }
    }
}

/// Connection health.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link to the session dropped without a `leave`.
    Lost { reason: String },
}

/// One join attempt, issued before the join runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTicket(u64);

/// Orders join attempts against `leave`. Issuing a ticket or closing the
/// gate invalidates every earlier ticket.
#[derive(Debug, Default)]
pub struct JoinGate {
    generation: AtomicU64,
}

impl JoinGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> JoinTicket {
        JoinTicket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether `ticket` is still the latest attempt.
    pub fn admits(&self, ticket: JoinTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Reserve a join attempt. Called synchronously by the requester, so a
    /// `leave` that follows always defeats the attempt.
    fn begin_join(&self) -> JoinTicket;

    /// Join (or create) a session. Any previous connection is dropped first.
    /// Fails without keeping anything when `ticket` has been superseded.
    async fn join(&self, ticket: JoinTicket, request: JoinRequest)
        -> Result<JoinAccepted, JoinError>;

    /// Forward an operation that was already applied to `document` locally.
    async fn submit_operation(
        &self,
        operation: &Operation,
        document: &OntologyDocument,
    ) -> Result<(), TransportError>;

    fn subscribe_document_changes(&self) -> Subscription<DocumentChange>;

    /// Called as each change is consumed. False means the change predates
    /// local writes the shared state already holds and must be skipped.
    fn accept_change(&self, _change: &DocumentChange) -> bool {
        true
    }

    async fn publish_presence(&self, update: PresenceUpdate) -> Result<(), TransportError>;

    fn subscribe_presence(&self) -> Subscription<PresenceEvent>;

    fn subscribe_link(&self) -> Subscription<LinkEvent>;

    /// Release the session. Idempotent; a join still in flight fails.
    async fn leave(&self) -> Result<(), TransportError>;
}
