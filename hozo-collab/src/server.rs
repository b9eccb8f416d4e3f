//! WebSocket relay server with per-session rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── SessionRoom (session id) ── OntologyDocument
//! Client B ──┘            │
//!                         └── broadcast channel
//!                                 │
//!                      ┌──────────┼──────────┐
//!                      ▼          ▼          ▼
//!                   Client A   Client B   Client C   (sender skipped)
//! ```
//!
//! Each room keeps the authoritative document so late joiners receive the
//! current state in `joined`. Rooms outlive their connections. They go away
//! through [`RelayServer::close_session`], or once they have been empty for
//! [`ServerConfig::session_ttl_secs`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hozo_core::OntologyDocument;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{AdmitError, Envelope, SessionRegistry, SessionRoom};
use crate::presence::assign_color;
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage, UserInfo};
use crate::session::SessionId;

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

const ANONYMOUS: &str = "Anonymous";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum users per session
    pub max_users_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Heartbeat ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Drop a connection silent for this long
    pub idle_timeout_secs: u64,
    /// Drop a session this long after its last member left. Zero keeps
    /// sessions until they are closed.
    pub session_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_users_per_session: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            session_ttl_secs: 3600,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub operations_relayed: u64,
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A joined connection.
struct Member {
    user: UserInfo,
    room: Arc<SessionRoom>,
    rx: broadcast::Receiver<Arc<Envelope>>,
}

/// The relay server. Cheap to clone; clones share sessions and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    sessions: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionRegistry::new(config.broadcast_capacity));
        Self {
            config,
            sessions,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register an uploaded document under a fresh session id.
    pub async fn create_session(&self, mut document: OntologyDocument) -> SessionId {
        document.normalize_links();
        let id = SessionId::generate();
        self.sessions.get_or_create(&id, document).await;
        self.refresh_session_count().await;
        id
    }

    /// Current document of a session, for download.
    pub async fn session_document(&self, id: &SessionId) -> Option<OntologyDocument> {
        Some(self.sessions.get(id).await?.document().await)
    }

    /// Destroy a session. Its members are disconnected.
    pub async fn close_session(&self, id: &SessionId) -> bool {
        let closed = self.sessions.remove(id).await.is_some();
        self.refresh_session_count().await;
        closed
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.session_ids().await
    }

    /// Users currently joined to a session.
    pub async fn session_users(&self, id: &SessionId) -> Vec<UserInfo> {
        match self.sessions.get(id).await {
            Some(room) => room.users().await,
            None => Vec::new(),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Drop sessions that have been empty for the configured TTL. Returns
    /// how many went away.
    pub async fn expire_idle_sessions(&self) -> usize {
        if self.config.session_ttl_secs == 0 {
            return 0;
        }
        let ttl = Duration::from_secs(self.config.session_ttl_secs);
        let expired = self.sessions.remove_idle(ttl).await;
        if !expired.is_empty() {
            self.refresh_session_count().await;
        }
        expired.len()
    }

    async fn refresh_session_count(&self) {
        let count = self.sessions.session_count().await;
        self.stats.write().await.active_sessions = count;
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve WebSocket connections accepted from `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        let sweeper = (self.config.session_ttl_secs > 0).then(|| self.spawn_sweeper());
        let result = self.accept_loop(listener).await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let period = Duration::from_secs(self.config.session_ttl_secs.clamp(1, 60));
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                server.expire_idle_sessions().await;
            }
        })
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Member> = None;
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();

        let outcome: Result<(), ServerError> = async {
            loop {
                let member_id = member.as_ref().map(|m| m.user.user_id);
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        last_seen = Instant::now();
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                match ClientMessage::decode(text.as_str()) {
                                    Ok(msg) => self.handle_message(msg, &mut member, &mut ws_sender).await?,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        send(&mut ws_sender, &ServerMessage::error(ErrorCode::BadRequest, e.to_string())).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing broadcast frame
                    envelope = next_envelope(&mut member) => {
                        match envelope {
                            Ok(envelope) => match envelope.as_ref() {
                                Envelope::Frame { from, text } => {
                                    // Don't echo back to sender
                                    if from.is_some() && *from == member_id {
                                        continue;
                                    }
                                    ws_sender.send(Message::Text(text.to_string().into())).await?;
                                }
                                Envelope::Closed => {
                                    log::info!("Session closed, dropping {addr}");
                                    break;
                                }
                            },
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // Missed operations cannot be replayed; the
                                // client resyncs from a fresh join.
                                log::warn!("User {member_id:?} lagged by {n} frames, disconnecting");
                                break;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        if last_seen.elapsed() > idle_timeout {
                            log::info!("Connection from {addr} idle for {:?}, closing", last_seen.elapsed());
                            break;
                        }
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: remove user from session and tell the others
        if let Some(m) = member.take() {
            m.room.remove_user(&m.user.user_id).await;
            let _ = m
                .room
                .broadcast(Some(m.user.user_id), &ServerMessage::user_left(&m.user));
            log::info!(
                "User {} ({}) left session {}",
                m.user.user_name,
                m.user.user_id,
                m.room.id()
            );
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        let _ = ws_sender.close().await;

        outcome
    }

    async fn handle_message(
        &self,
        msg: ClientMessage,
        member: &mut Option<Member>,
        ws_sender: &mut WsSender,
    ) -> Result<(), ServerError> {
        match msg {
            ClientMessage::Join {
                session_id,
                user_name,
                ontology,
            } => {
                if member.is_some() {
                    return send(
                        ws_sender,
                        &ServerMessage::error(ErrorCode::BadRequest, "Already joined"),
                    )
                    .await;
                }

                let room = match self.sessions.get(&session_id).await {
                    Some(room) => room,
                    None => match ontology {
                        Some(document) => {
                            let (room, _) = self.sessions.get_or_create(&session_id, document).await;
                            self.refresh_session_count().await;
                            room
                        }
                        None => {
                            log::info!("Join for unknown session {session_id}");
                            return send(
                                ws_sender,
                                &ServerMessage::error(ErrorCode::SessionNotFound, "Session not found"),
                            )
                            .await;
                        }
                    },
                };

                let user_name = match user_name.trim() {
                    "" => ANONYMOUS.to_string(),
                    name => name.to_string(),
                };
                let user_id = Uuid::new_v4();
                let user = UserInfo {
                    user_id,
                    user_name,
                    color: assign_color(&user_id),
                };

                let admission = match room
                    .admit(user.clone(), self.config.max_users_per_session)
                    .await
                {
                    Ok(admission) => admission,
                    Err(AdmitError::Full) => {
                        log::warn!("Session {session_id} is full");
                        return send(
                            ws_sender,
                            &ServerMessage::error(ErrorCode::SessionFull, "Session is full"),
                        )
                        .await;
                    }
                    Err(AdmitError::Closed) => {
                        log::info!("Join for expired session {session_id}");
                        return send(
                            ws_sender,
                            &ServerMessage::error(ErrorCode::SessionNotFound, "Session not found"),
                        )
                        .await;
                    }
                };

                send(
                    ws_sender,
                    &ServerMessage::Joined {
                        user_id,
                        color: user.color.clone(),
                        ontology: admission.document,
                        users: admission.users,
                    },
                )
                .await?;
                room.broadcast(Some(user_id), &ServerMessage::user_joined(&user))?;

                log::info!("User {} ({}) joined session {}", user.user_name, user_id, session_id);
                *member = Some(Member {
                    user,
                    room,
                    rx: admission.receiver,
                });
            }

            ClientMessage::Operation { operation } => match member {
                Some(m) => {
                    let kind = operation.kind();
                    let outcome = m.room.apply(m.user.user_id, operation).await?;
                    log::debug!("{kind} from {} in {}: {outcome:?}", m.user.user_id, m.room.id());
                    self.stats.write().await.operations_relayed += 1;
                }
                None => {
                    send(
                        ws_sender,
                        &ServerMessage::error(ErrorCode::BadRequest, "Join a session first"),
                    )
                    .await?;
                }
            },

            ClientMessage::Cursor { cursor } => {
                if let Some(m) = member {
                    log::trace!("Cursor from {} in {}", m.user.user_id, m.room.id());
                    m.room
                        .broadcast(Some(m.user.user_id), &ServerMessage::cursor_update(&m.user, cursor))?;
                }
            }
        }
        Ok(())
    }
}

async fn send(ws_sender: &mut WsSender, msg: &ServerMessage) -> Result<(), ServerError> {
    ws_sender.send(Message::Text(msg.encode()?.into())).await?;
    Ok(())
}

async fn next_envelope(
    member: &mut Option<Member>,
) -> Result<Arc<Envelope>, broadcast::error::RecvError> {
    match member {
        Some(m) => m.rx.recv().await,
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hozo_core::{Concept, Point};

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_users_per_session, 100);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.idle_timeout_secs, 90);
        assert_eq!(config.session_ttl_secs, 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unvisited_session_expires() {
        let server = RelayServer::new(ServerConfig {
            session_ttl_secs: 60,
            ..ServerConfig::default()
        });
        let id = server.create_session(OntologyDocument::new("a.xml", "d")).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(server.expire_idle_sessions().await, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(server.expire_idle_sessions().await, 1);
        assert!(server.session_document(&id).await.is_none());
        assert_eq!(server.stats().await.active_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_keeps_sessions() {
        let server = RelayServer::new(ServerConfig {
            session_ttl_secs: 0,
            ..ServerConfig::default()
        });
        let id = server.create_session(OntologyDocument::default()).await;
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(server.expire_idle_sessions().await, 0);
        assert!(server.session_document(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_create_and_close_session() {
        let server = RelayServer::with_defaults();
        let mut doc = OntologyDocument::new("animals.xml", "d1");
        doc.concepts.push(Concept::new("1", "Animal", Point::ORIGIN));
        doc.concepts.push(Concept::new("2", "Dog", Point::ORIGIN));
        doc.isa_links.push(hozo_core::IsaEdge::new("e1", "Animal", "Dog"));

        let id = server.create_session(doc).await;
        let stored = server.session_document(&id).await.unwrap();
        assert_eq!(stored.isa_links[0].parent, "1");
        assert_eq!(server.stats().await.active_sessions, 1);
        assert_eq!(server.session_ids().await, vec![id.clone()]);

        assert!(server.close_session(&id).await);
        assert!(!server.close_session(&id).await);
        assert!(server.session_document(&id).await.is_none());
        assert_eq!(server.stats().await.active_sessions, 0);
    }
}
