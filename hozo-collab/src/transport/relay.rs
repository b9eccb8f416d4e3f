//! WebSocket transport to a relay server.
//!
//! One WebSocket per join. A writer task drains an outgoing channel into
//! the socket; a reader task decodes relay frames and fans them out to the
//! transport's hubs. When the reader ends without a `leave`, a
//! [`LinkEvent::Lost`] is emitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use hozo_core::{OntologyDocument, Operation};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{
    DocumentChange, JoinAccepted, JoinError, JoinGate, JoinRequest, JoinTicket, LinkEvent,
    Transport, TransportError,
};
use crate::presence::{PresenceEvent, PresenceUpdate, UserId, UserPresence};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::subscription::{EventHub, Subscription};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Relay transport configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay WebSocket URL, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    /// How long to wait for `joined` after connecting.
    pub join_timeout: Duration,
    /// Outgoing frame buffer.
    pub outgoing_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".into(),
            join_timeout: Duration::from_secs(10),
            outgoing_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct Hubs {
    documents: EventHub<DocumentChange>,
    presence: EventHub<PresenceEvent>,
    link: EventHub<LinkEvent>,
}

struct RelayConnection {
    user_id: UserId,
    outgoing: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        // The writer exits once every outgoing sender is gone and closes
        // the socket on its way out.
        self.closing.store(true, Ordering::SeqCst);
        self.reader.abort();
    }
}

/// [`Transport`] over a relay server.
pub struct RelayTransport {
    config: RelayConfig,
    connection: Mutex<Option<RelayConnection>>,
    gate: JoinGate,
    hubs: Hubs,
}

impl RelayTransport {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            gate: JoinGate::new(),
            hubs: Hubs {
                documents: EventHub::new(),
                presence: EventHub::new(),
                link: EventHub::new(),
            },
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /// User id the relay assigned on the current connection.
    pub fn local_user_id(&self) -> Option<UserId> {
        self.connection().as_ref().map(|c| c.user_id)
    }

    fn connection(&self) -> MutexGuard<'_, Option<RelayConnection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outgoing(&self) -> Option<mpsc::Sender<Message>> {
        self.connection().as_ref().map(|c| c.outgoing.clone())
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn begin_join(&self) -> JoinTicket {
        self.gate.issue()
    }

    async fn join(
        &self,
        ticket: JoinTicket,
        request: JoinRequest,
    ) -> Result<JoinAccepted, JoinError> {
        let previous = {
            let mut current = self.connection();
            if !self.gate.admits(ticket) {
                log::debug!("Join of {} superseded before it started", request.session_id);
                return Err(superseded());
            }
            current.take()
        };
        drop(previous);

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| JoinError::TransportUnavailable(e.to_string()))?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.outgoing_capacity.max(1));
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let closing = Arc::new(AtomicBool::new(false));
        let (joined_tx, joined_rx) = oneshot::channel();
        let reader = tokio::spawn(read_frames(
            ws_reader,
            self.hubs.clone(),
            closing.clone(),
            joined_tx,
            out_tx.clone(),
        ));
        let mut connection = RelayConnection {
            user_id: UserId::nil(),
            outgoing: out_tx,
            reader,
            closing,
        };

        let frame = ClientMessage::Join {
            session_id: request.session_id.clone(),
            user_name: request.user_name.clone(),
            ontology: request.seed.clone(),
        }
        .encode()
        .map_err(|e| JoinError::Rejected(e.to_string()))?;
        connection
            .outgoing
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| JoinError::TransportUnavailable("connection closed".into()))?;

        let reply = match tokio::time::timeout(self.config.join_timeout, joined_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(JoinError::TransportUnavailable(
                    "connection closed during join".into(),
                ))
            }
            Err(_) => {
                return Err(JoinError::TransportUnavailable(format!(
                    "no reply within {:?}",
                    self.config.join_timeout
                )))
            }
        };

        match reply {
            ServerMessage::Joined {
                user_id,
                color,
                ontology,
                users,
            } => {
                connection.user_id = user_id;
                {
                    let mut current = self.connection();
                    if !self.gate.admits(ticket) {
                        drop(current);
                        // Dropping the connection closes the socket; the
                        // relay then reports the user as gone.
                        log::debug!("Discarding join of {}: superseded", request.session_id);
                        return Err(superseded());
                    }
                    *current = Some(connection);
                }
                log::info!(
                    "Joined session {} as {} via {}",
                    request.session_id,
                    user_id,
                    self.config.url
                );
                Ok(JoinAccepted {
                    local_user_id: user_id,
                    color,
                    document: ontology,
                    users: users.into_iter().map(UserPresence::from).collect(),
                })
            }
            ServerMessage::Error { message, code } => {
                log::info!("Relay refused join of {}: {}", request.session_id, message);
                Err(match code {
                    Some(ErrorCode::SessionNotFound) => JoinError::SessionNotFound(request.session_id),
                    None if message.eq_ignore_ascii_case("session not found") => {
                        JoinError::SessionNotFound(request.session_id)
                    }
                    _ => JoinError::Rejected(message),
                })
            }
            other => Err(JoinError::Rejected(format!("unexpected reply: {:?}", other))),
        }
    }

    async fn submit_operation(
        &self,
        operation: &Operation,
        _document: &OntologyDocument,
    ) -> Result<(), TransportError> {
        let outgoing = self.outgoing().ok_or(TransportError::NotConnected)?;
        let frame = ClientMessage::Operation {
            operation: operation.clone(),
        }
        .encode()?;
        outgoing
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    fn subscribe_document_changes(&self) -> Subscription<DocumentChange> {
        self.hubs.documents.subscribe()
    }

    async fn publish_presence(&self, update: PresenceUpdate) -> Result<(), TransportError> {
        let cursor = match update {
            PresenceUpdate::Cursor(cursor) => cursor,
            // Closing the socket is the relay's leave signal.
            PresenceUpdate::Leave => return Ok(()),
        };
        let outgoing = self.outgoing().ok_or(TransportError::NotConnected)?;
        let frame = ClientMessage::Cursor { cursor }.encode()?;
        match outgoing.try_send(Message::Text(frame.into())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::trace!("Outgoing buffer full, dropping cursor");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::NotConnected),
        }
    }

    fn subscribe_presence(&self) -> Subscription<PresenceEvent> {
        self.hubs.presence.subscribe()
    }

    fn subscribe_link(&self) -> Subscription<LinkEvent> {
        self.hubs.link.subscribe()
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let connection = {
            let mut current = self.connection();
            self.gate.close();
            current.take()
        };
        if let Some(connection) = connection {
            log::info!("Leaving relay session as {}", connection.user_id);
        }
        Ok(())
    }
}

fn superseded() -> JoinError {
    JoinError::TransportUnavailable("join superseded".into())
}

async fn read_frames(
    mut ws_reader: WsReader,
    hubs: Hubs,
    closing: Arc<AtomicBool>,
    joined_tx: oneshot::Sender<ServerMessage>,
    pong_tx: mpsc::Sender<Message>,
) {
    let mut joined_tx = Some(joined_tx);
    let reason = loop {
        let frame = match ws_reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        };
        match frame {
            Message::Text(text) => match ServerMessage::decode(text.as_str()) {
                Ok(msg) => dispatch(msg, &hubs, &mut joined_tx),
                Err(e) => log::warn!("Dropping relay frame: {}", e),
            },
            Message::Ping(data) => {
                let _ = pong_tx.try_send(Message::Pong(data));
            }
            Message::Close(_) => break "closed by relay".to_string(),
            _ => {}
        }
    };

    // Only a joined connection can be lost; failed joins report through
    // the join result.
    if joined_tx.is_none() && !closing.load(Ordering::SeqCst) {
        log::warn!("Relay link lost: {}", reason);
        hubs.link.emit(LinkEvent::Lost { reason });
    }
}

fn dispatch(
    msg: ServerMessage,
    hubs: &Hubs,
    joined_tx: &mut Option<oneshot::Sender<ServerMessage>>,
) {
    match msg {
        reply @ (ServerMessage::Joined { .. } | ServerMessage::Error { .. })
            if joined_tx.is_some() =>
        {
            if let Some(tx) = joined_tx.take() {
                let _ = tx.send(reply);
            }
        }
        ServerMessage::Joined { .. } => log::warn!("Ignoring repeated joined frame"),
        ServerMessage::Error { message, .. } => log::warn!("Relay error: {}", message),
        ServerMessage::Operation { operation } => {
            hubs.documents.emit(DocumentChange::Operation(operation));
        }
        ServerMessage::UserJoined {
            user_id,
            user_name,
            color,
        } => {
            hubs.presence.emit(PresenceEvent::Joined {
                user_id,
                name: user_name,
                color,
            });
        }
        ServerMessage::UserLeft { user_id, .. } => {
            hubs.presence.emit(PresenceEvent::Left { user_id });
        }
        ServerMessage::CursorUpdate {
            user_id,
            user_name,
            color,
            cursor,
        } => {
            hubs.presence.emit(PresenceEvent::Cursor {
                user_id,
                name: user_name,
                color,
                cursor,
            });
        }
    }
}
