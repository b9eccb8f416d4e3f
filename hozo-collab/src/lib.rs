//! # hozo-collab: Real-time collaboration for ontology documents
//!
//! Lets several users edit one [`OntologyDocument`](hozo_core::OntologyDocument)
//! at once. Edits are applied locally first and then forwarded; remote
//! edits arrive through a [`Transport`] and pass through the same applier.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐                      ┌───────────────┐
//! │ SessionClient │                      │  RelayServer  │
//! │  (per user)   │ ◄──── JSON / WS ───► │   (central)   │
//! └───────┬───────┘   RelayTransport     └───────┬───────┘
//!         │                                      │
//!         │           ReplicatedDocTransport     ▼
//!         └──────────► SharedStore         ┌─────────────┐
//!                      (whole document)    │ SessionRoom │
//!                                          │  (fan-out)  │
//!                                          └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`client`]: session client state machine with offline queue
//! - [`transport`]: the transport seam and its two implementations
//! - [`protocol`]: JSON wire messages for the relay
//! - [`server`]: WebSocket relay server
//! - [`broadcast`]: per-session rooms and fan-out
//! - [`presence`]: presence table, cursor throttling, user colors
//! - [`store`]: shared store contract and in-memory store
//! - [`session`]: session ids and share links
//! - [`reconnect`]: fixed-delay rejoin timing
//! - [`subscription`]: cancellable event fan-out

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod store;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, SessionRegistry, SessionRoom};
pub use client::{
    ConnectionState, ListenerId, OfflineQueue, SessionClient, SessionConfig, SessionError,
    SessionEvent,
};
pub use presence::{
    assign_color, PresenceEvent, PresenceTable, PresenceUpdate, RosterChange, UserId,
    UserPresence,
};
pub use protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage, UserInfo};
pub use reconnect::ReconnectionSupervisor;
pub use server::{RelayServer, ServerConfig, ServerError, ServerStats};
pub use session::SessionId;
pub use store::{MemoryStore, SharedStore, StoreError};
pub use subscription::{EventHub, Subscription};
pub use transport::{
    DocumentChange, JoinAccepted, JoinError, JoinGate, JoinRequest, JoinTicket, LinkEvent,
    RelayConfig, RelayTransport, ReplicatedDocTransport, Transport, TransportError, WriteStamp,
};
