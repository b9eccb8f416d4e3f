//! Transport over a [`SharedStore`]: the whole document is the unit of
//! replication.
//!
//! Each submitted operation writes the full post-apply document; every
//! client watching the session receives it as a snapshot. Concurrent
//! writers resolve last-writer-wins at document granularity.
//!
//! Writers receive their own writes back. Each write is stamped with the
//! writer's id and a running count, and snapshots consumed before the echo
//! of the latest own write are skipped: the store already holds something
//! newer.
//!
//! Presence lives next to the document. A joined client registers
//! `users/{id}` and asks the store to drop that record and its cursor when
//! the link ends, so a vanished client disappears without cooperation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hozo_core::{OntologyDocument, Operation, Point};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    DocumentChange, JoinAccepted, JoinError, JoinGate, JoinRequest, JoinTicket, LinkEvent,
    Transport, TransportError,
};
use crate::presence::{assign_color, PresenceEvent, PresenceUpdate, UserId, UserPresence};
use crate::session::SessionId;
use crate::store::{
    decode_record, encode_record, paths, DocumentRecord, LinkId, SharedStore, StoreError,
    StoreSnapshot, UserRecord, WriteStamp,
};
use crate::subscription::{EventHub, Subscription};

#[derive(Clone)]
struct Hubs {
    documents: EventHub<DocumentChange>,
    presence: EventHub<PresenceEvent>,
    link: EventHub<LinkEvent>,
}

/// Own document writes against what has come back on the watch.
#[derive(Debug, Default)]
struct Echoes {
    next: u64,
    /// Latest write the store accepted.
    confirmed: u64,
    /// Latest write whose echo is awaited.
    written: u64,
    echoed: u64,
}

impl Echoes {
    fn begin_write(&mut self) -> u64 {
        self.next += 1;
        self.written = self.next;
        self.next
    }

    fn finish_write(&mut self, seq: u64, ok: bool) {
        if ok {
            self.confirmed = self.confirmed.max(seq);
        } else if self.written == seq {
            self.written = self.confirmed;
        }
    }

    /// `own` is the sequence number when the snapshot is one of our writes.
    fn accept(&mut self, own: Option<u64>) -> bool {
        if let Some(seq) = own {
            self.echoed = self.echoed.max(seq);
        }
        self.echoed >= self.written
    }
}

struct ReplicaSession {
    link: LinkId,
    session_id: SessionId,
    user_id: UserId,
    echoes: Echoes,
    forwarders: Vec<JoinHandle<()>>,
}

impl Drop for ReplicaSession {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}

/// [`Transport`] that replicates whole documents through a [`SharedStore`].
pub struct ReplicatedDocTransport {
    store: Arc<dyn SharedStore>,
    session: Mutex<Option<ReplicaSession>>,
    gate: JoinGate,
    hubs: Hubs,
}

impl ReplicatedDocTransport {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            session: Mutex::new(None),
            gate: JoinGate::new(),
            hubs: Hubs {
                documents: EventHub::new(),
                presence: EventHub::new(),
                link: EventHub::new(),
            },
        }
    }

    /// Store link of the current session.
    pub fn link(&self) -> Option<LinkId> {
        self.session().as_ref().map(|s| s.link)
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        self.session().as_ref().map(|s| s.user_id)
    }

    fn session(&self) -> MutexGuard<'_, Option<ReplicaSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> Option<(LinkId, SessionId, UserId)> {
        self.session()
            .as_ref()
            .map(|s| (s.link, s.session_id.clone(), s.user_id))
    }

    async fn enter(
        &self,
        link: LinkId,
        request: &JoinRequest,
    ) -> Result<(JoinAccepted, Vec<JoinHandle<()>>), JoinError> {
        let session_id = &request.session_id;
        let doc_path = paths::document(session_id);

        let document = match self.store.read(link, &doc_path).await.map_err(unavailable)? {
            Some(bytes) => {
                decode_record::<DocumentRecord>(&bytes)
                    .map_err(|e| JoinError::Rejected(e.to_string()))?
                    .document
            }
            None => match &request.seed {
                Some(seed) => {
                    let bytes = encode_record(&DocumentRecord {
                        stamp: None,
                        document: seed.clone(),
                    })
                    .map_err(|e| JoinError::Rejected(e.to_string()))?;
                    self.store
                        .write(link, &doc_path, bytes)
                        .await
                        .map_err(unavailable)?;
                    log::info!("Created session {} from {}", session_id, seed.filename);
                    seed.clone()
                }
                None => return Err(JoinError::SessionNotFound(session_id.clone())),
            },
        };

        let user_id = Uuid::new_v4();
        let color = assign_color(&user_id);
        let user_path = paths::user(session_id, &user_id);
        let record = encode_record(&UserRecord {
            name: request.user_name.clone(),
            color: color.clone(),
        })
        .map_err(|e| JoinError::Rejected(e.to_string()))?;
        self.store
            .write(link, &user_path, record)
            .await
            .map_err(unavailable)?;
        self.store
            .remove_on_disconnect(link, &user_path)
            .await
            .map_err(unavailable)?;
        self.store
            .remove_on_disconnect(link, &paths::cursor(session_id, &user_id))
            .await
            .map_err(unavailable)?;

        let users_path = paths::users(session_id);
        let cursors_path = paths::cursors(session_id);
        let users = self
            .store
            .read_tree(link, &users_path)
            .await
            .map_err(unavailable)?;
        let cursors = self
            .store
            .read_tree(link, &cursors_path)
            .await
            .map_err(unavailable)?;

        let forwarders = vec![
            forward_link(self.store.link_events(link), self.hubs.link.clone()),
            forward_document(
                self.store.watch(link, &doc_path),
                doc_path,
                self.hubs.documents.clone(),
            ),
            forward_presence(
                self.store.watch(link, &users_path),
                self.store.watch(link, &cursors_path),
                self.hubs.presence.clone(),
            ),
        ];

        log::info!("Joined session {} as {}", session_id, user_id);
        Ok((
            JoinAccepted {
                local_user_id: user_id,
                color,
                document,
                users: presence_from(&users, &cursors),
            },
            forwarders,
        ))
    }
}

fn unavailable(err: StoreError) -> JoinError {
    JoinError::TransportUnavailable(err.to_string())
}

fn superseded() -> JoinError {
    JoinError::TransportUnavailable("join superseded".into())
}

/// Build presence rows from `users/*` records and `cursors/*` points.
fn presence_from(users: &StoreSnapshot, cursors: &StoreSnapshot) -> Vec<UserPresence> {
    let points: HashMap<&str, Point> = cursors
        .iter()
        .filter_map(|(path, bytes)| Some((paths::leaf(path), decode_record(bytes).ok()?)))
        .collect();

    users
        .iter()
        .filter_map(|(path, bytes)| {
            let leaf = paths::leaf(path);
            let user_id = Uuid::parse_str(leaf).ok()?;
            let record: UserRecord = decode_record(bytes).ok()?;
            Some(UserPresence {
                user_id,
                name: record.name,
                color: record.color,
                cursor: points.get(leaf).copied(),
            })
        })
        .collect()
}

fn forward_link(mut events: Subscription<LinkEvent>, hub: EventHub<LinkEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log::warn!("Store link lost: {:?}", event);
            hub.emit(event);
        }
    })
}

fn forward_document(
    mut watch: Subscription<StoreSnapshot>,
    doc_path: String,
    hub: EventHub<DocumentChange>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(snapshot) = watch.recv().await {
            let Some(bytes) = snapshot.get(&doc_path) else {
                log::warn!("Session document at {} was removed", doc_path);
                continue;
            };
            match decode_record::<DocumentRecord>(bytes) {
                Ok(record) => {
                    hub.emit(DocumentChange::Snapshot {
                        document: record.document,
                        stamp: record.stamp,
                    });
                }
                Err(e) => log::warn!("Skipping unreadable document snapshot: {}", e),
            }
        }
    })
}

fn forward_presence(
    mut users_watch: Subscription<StoreSnapshot>,
    mut cursors_watch: Subscription<StoreSnapshot>,
    hub: EventHub<PresenceEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut users = StoreSnapshot::new();
        let mut cursors = StoreSnapshot::new();
        loop {
            tokio::select! {
                Some(next) = users_watch.recv() => users = next,
                Some(next) = cursors_watch.recv() => cursors = next,
                else => break,
            }
            hub.emit(PresenceEvent::Snapshot(presence_from(&users, &cursors)));
        }
    })
}

#[async_trait]
impl Transport for ReplicatedDocTransport {
    fn name(&self) -> &'static str {
        "replicated"
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
            let mut current = self.session();
            if !self.gate.admits(ticket) {
                log::debug!("Join of {} superseded before it started", request.session_id);
                return Err(superseded());
            }
            current.take()
        };
        if let Some(previous) = previous {
            self.store.close_link(previous.link).await;
        }

        let link = self.store.open_link().await.map_err(unavailable)?;
        match self.enter(link, &request).await {
            Ok((accepted, forwarders)) => {
                let session = ReplicaSession {
                    link,
                    session_id: request.session_id.clone(),
                    user_id: accepted.local_user_id,
                    echoes: Echoes::default(),
                    forwarders,
                };
                {
                    let mut current = self.session();
                    if self.gate.admits(ticket) {
                        *current = Some(session);
                        return Ok(accepted);
                    }
                }
                log::debug!("Discarding join of {}: superseded", request.session_id);
                drop(session);
                // Runs the disconnect removals for the registration.
                self.store.close_link(link).await;
                Err(superseded())
            }
            Err(e) => {
                self.store.close_link(link).await;
                Err(e)
            }
        }
    }

    async fn submit_operation(
        &self,
        operation: &Operation,
        document: &OntologyDocument,
    ) -> Result<(), TransportError> {
        let (link, session_id, stamp) = {
            let mut current = self.session();
            let session = current.as_mut().ok_or(TransportError::NotConnected)?;
            let seq = session.echoes.begin_write();
            (
                session.link,
                session.session_id.clone(),
                WriteStamp {
                    writer: session.user_id,
                    seq,
                },
            )
        };
        log::trace!("Replicating document after {} (write {})", operation.kind(), stamp.seq);

        let record = DocumentRecord {
            stamp: Some(stamp),
            document: document.clone(),
        };
        let written = match encode_record(&record) {
            Ok(bytes) => {
                self.store
                    .write(link, &paths::document(&session_id), bytes)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Some(session) = self.session().as_mut() {
            if session.user_id == stamp.writer {
                session.echoes.finish_write(stamp.seq, written.is_ok());
            }
        }
        written?;
        Ok(())
    }

    fn subscribe_document_changes(&self) -> Subscription<DocumentChange> {
        self.hubs.documents.subscribe()
    }

    fn accept_change(&self, change: &DocumentChange) -> bool {
        let DocumentChange::Snapshot { stamp, .. } = change else {
            return true;
        };
        let mut current = self.session();
        let Some(session) = current.as_mut() else {
            return true;
        };
        let own = match stamp {
            Some(stamp) if stamp.writer == session.user_id => Some(stamp.seq),
            _ => None,
        };
        let accepted = session.echoes.accept(own);
        if !accepted {
            log::trace!("Skipping document revision {:?}: a newer own write is pending", stamp);
        }
        accepted
    }

    async fn publish_presence(&self, update: PresenceUpdate) -> Result<(), TransportError> {
        let (link, session_id, user_id) = self.current().ok_or(TransportError::NotConnected)?;
        let path = paths::cursor(&session_id, &user_id);
        match update {
            PresenceUpdate::Cursor(point) => {
                self.store.write(link, &path, encode_record(&point)?).await?
            }
            PresenceUpdate::Leave => self.store.remove(link, &path).await?,
        }
        Ok(())
    }

    fn subscribe_presence(&self) -> Subscription<PresenceEvent> {
        self.hubs.presence.subscribe()
    }

    fn subscribe_link(&self) -> Subscription<LinkEvent> {
        self.hubs.link.subscribe()
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let session = {
            let mut current = self.session();
            self.gate.close();
            current.take()
        };
        if let Some(session) = session {
            log::info!("Leaving session {} as {}", session.session_id, session.user_id);
            let link = session.link;
            let user_path = paths::user(&session.session_id, &session.user_id);
            let cursor_path = paths::cursor(&session.session_id, &session.user_id);
            drop(session);
            let _ = self.store.remove(link, &cursor_path).await;
            let _ = self.store.remove(link, &user_path).await;
            self.store.close_link(link).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use hozo_core::Concept;

    fn seed() -> OntologyDocument {
        let mut doc = OntologyDocument::new("animals.xml", "doc-1");
        doc.concepts.push(Concept::new("1", "Animal", Point::ORIGIN));
        doc
    }

    fn request(session: &str, seed: Option<OntologyDocument>) -> JoinRequest {
        JoinRequest {
            session_id: SessionId::new(session),
            user_name: "Alice".into(),
            seed,
        }
    }

    #[tokio::test]
    async fn test_join_without_seed_on_missing_session() {
        let store = MemoryStore::new();
        let transport = ReplicatedDocTransport::new(Arc::new(store.clone()));
        let result = transport
            .join(transport.begin_join(), request("nope", None))
            .await;
        assert_eq!(result, Err(JoinError::SessionNotFound(SessionId::new("nope"))));
        assert_eq!(store.link_count(), 0);
    }

    #[tokio::test]
    async fn test_join_creates_and_registers() {
        let store = MemoryStore::new();
        let transport = ReplicatedDocTransport::new(Arc::new(store.clone()));
        let accepted = transport
            .join(transport.begin_join(), request("s1", Some(seed())))
            .await
            .unwrap();

        assert_eq!(accepted.document, seed());
        assert_eq!(accepted.users.len(), 1);
        assert_eq!(accepted.users[0].name, "Alice");
        assert_eq!(accepted.color, assign_color(&accepted.local_user_id));
        assert!(store
            .get(&paths::user(&SessionId::new("s1"), &accepted.local_user_id))
            .is_some());

        transport.leave().await.unwrap();
        assert_eq!(store.keys(), vec!["sessions/s1/document".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_session_ignores_seed() {
        let store = Arc::new(MemoryStore::new());
        let first = ReplicatedDocTransport::new(store.clone());
        first
            .join(first.begin_join(), request("s1", Some(seed())))
            .await
            .unwrap();

        let second = ReplicatedDocTransport::new(store.clone());
        let accepted = second
            .join(
                second.begin_join(),
                request("s1", Some(OntologyDocument::new("other.xml", "x"))),
            )
            .await
            .unwrap();
        assert_eq!(accepted.document.filename, "animals.xml");
        assert_eq!(accepted.users.len(), 2);
    }

    #[tokio::test]
    async fn test_join_during_outage_is_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let transport = ReplicatedDocTransport::new(Arc::new(store));
        assert!(matches!(
            transport
                .join(transport.begin_join(), request("s1", Some(seed())))
                .await,
            Err(JoinError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_join_after_leave_keeps_nothing() {
        let store = MemoryStore::new();
        let transport = ReplicatedDocTransport::new(Arc::new(store.clone()));
        let ticket = transport.begin_join();
        transport.leave().await.unwrap();

        let result = transport.join(ticket, request("s1", Some(seed()))).await;
        assert!(matches!(result, Err(JoinError::TransportUnavailable(_))));
        assert!(store.keys().is_empty());
        assert_eq!(store.link_count(), 0);
        assert!(transport.link().is_none());
    }

    #[tokio::test]
    async fn test_superseded_join_keeps_the_newer_session() {
        let store = MemoryStore::new();
        let transport = ReplicatedDocTransport::new(Arc::new(store.clone()));
        let stale = transport.begin_join();
        let fresh = transport.begin_join();

        let accepted = transport
            .join(fresh, request("s1", Some(seed())))
            .await
            .unwrap();
        assert!(transport.join(stale, request("s1", None)).await.is_err());
        assert_eq!(transport.local_user_id(), Some(accepted.local_user_id));
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn test_own_echoes_older_than_latest_write_are_skipped() {
        let store = MemoryStore::new();
        let transport = ReplicatedDocTransport::new(Arc::new(store.clone()));
        let accepted = transport
            .join(transport.begin_join(), request("s1", Some(seed())))
            .await
            .unwrap();
        let me = accepted.local_user_id;
        let snapshot = |stamp: Option<WriteStamp>| DocumentChange::Snapshot {
            document: seed(),
            stamp,
        };

        let mut doc = seed();
        for id in ["a", "b"] {
            doc.concepts.push(Concept::new(id, id, Point::ORIGIN));
            transport
                .submit_operation(&Operation::delete_concept("x"), &doc)
                .await
                .unwrap();
        }

        // Seed, then the first echo: both older than write 2.
        assert!(!transport.accept_change(&snapshot(None)));
        assert!(!transport.accept_change(&snapshot(Some(WriteStamp { writer: me, seq: 1 }))));
        assert!(transport.accept_change(&snapshot(Some(WriteStamp { writer: me, seq: 2 }))));
        // Anything after the latest echo is current again.
        let other = WriteStamp {
            writer: Uuid::new_v4(),
            seq: 1,
        };
        assert!(transport.accept_change(&snapshot(Some(other))));
        assert!(transport.accept_change(&DocumentChange::Operation(Operation::delete_concept("a"))));
    }

    #[test]
    fn test_failed_write_is_not_awaited() {
        let mut echoes = Echoes::default();
        let first = echoes.begin_write();
        echoes.finish_write(first, true);
        let second = echoes.begin_write();
        echoes.finish_write(second, false);

        assert!(!echoes.accept(None));
        assert!(echoes.accept(Some(first)));
        assert!(echoes.accept(None));
    }

    #[test]
    fn test_presence_from_pairs_cursors() {
        let alice = Uuid::new_v4();
        let ghost = Uuid::new_v4();
        let session = SessionId::new("s");
        let mut users = StoreSnapshot::new();
        users.insert(
            paths::user(&session, &alice),
            encode_record(&UserRecord {
                name: "Alice".into(),
                color: "#112233".into(),
            })
            .unwrap(),
        );
        let mut cursors = StoreSnapshot::new();
        cursors.insert(
            paths::cursor(&session, &alice),
            encode_record(&Point::new(4.0, 2.0)).unwrap(),
        );
        cursors.insert(
            paths::cursor(&session, &ghost),
            encode_record(&Point::new(0.0, 0.0)).unwrap(),
        );

        let rows = presence_from(&users, &cursors);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, alice);
        assert_eq!(rows[0].cursor, Some(Point::new(4.0, 2.0)));
    }
}
