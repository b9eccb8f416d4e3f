//! Replicated key-value store used by the relay-less transport.
//!
//! The store is a tree of slash-separated paths holding opaque records.
//! Clients reach it through a *link*: writes go through a link, watches are
//! scoped to a link, and each link can register paths to remove when it
//! goes away. Losing a link (network drop, store outage) is reported on
//! [`SharedStore::link_events`].
//!
//! ```text
//! sessions/{session}/document        DocumentRecord
//! sessions/{session}/users/{user}    UserRecord
//! sessions/{session}/cursors/{user}  Point
//! ```
//!
//! Records are bincode-encoded.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hozo_core::OntologyDocument;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::presence::UserId;
use crate::subscription::{EventHub, Subscription};
use crate::transport::LinkEvent;

pub type LinkId = u64;

/// Every record under a watched path, keyed by full path.
pub type StoreSnapshot = BTreeMap<String, Vec<u8>>;

/// Store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("link {0} is closed")]
    LinkClosed(LinkId),
    #[error("record encode failed: {0}")]
    Encode(String),
    #[error("record decode failed: {0}")]
    Decode(String),
}

/// A replicated store reachable over links.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn open_link(&self) -> Result<LinkId, StoreError>;

    /// Close a link on purpose. Its disconnect removals still run but no
    /// loss is reported.
    async fn close_link(&self, link: LinkId);

    async fn read(&self, link: LinkId, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Records directly or indirectly under `path`, keyed by full path.
    async fn read_tree(&self, link: LinkId, path: &str) -> Result<StoreSnapshot, StoreError>;

    async fn write(&self, link: LinkId, path: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn remove(&self, link: LinkId, path: &str) -> Result<(), StoreError>;

    /// Remove `path` whenever `link` ends.
    async fn remove_on_disconnect(&self, link: LinkId, path: &str) -> Result<(), StoreError>;

    /// Current subtree under `path` immediately, then again after every change.
    fn watch(&self, link: LinkId, path: &str) -> Subscription<StoreSnapshot>;

    fn link_events(&self, link: LinkId) -> Subscription<LinkEvent>;
}

// ───────────────────────────────────────────────────────────────────
// Paths and records
// ───────────────────────────────────────────────────────────────────

pub mod paths {
    use crate::presence::UserId;
    use crate::session::SessionId;

    pub fn session(session: &SessionId) -> String {
        format!("sessions/{}", session)
    }

    pub fn document(session: &SessionId) -> String {
        format!("sessions/{}/document", session)
    }

    pub fn users(session: &SessionId) -> String {
        format!("sessions/{}/users", session)
    }

    pub fn user(session: &SessionId, user: &UserId) -> String {
        format!("sessions/{}/users/{}", session, user)
    }

    pub fn cursors(session: &SessionId) -> String {
        format!("sessions/{}/cursors", session)
    }

    pub fn cursor(session: &SessionId, user: &UserId) -> String {
        format!("sessions/{}/cursors/{}", session, user)
    }

    /// Last path segment.
    pub fn leaf(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }
}

/// Presence registration stored under `users/{user}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub color: String,
}

/// Identifies one document write: who wrote it and that writer's running
/// write count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStamp {
    pub writer: UserId,
    pub seq: u64,
}

/// Session document stored under `document`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// `None` for the document a session was created from.
    pub stamp: Option<WriteStamp>,
    pub document: OntologyDocument,
}

pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Encode(e.to_string()))
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(record)
}

fn covers(watched: &str, path: &str) -> bool {
    path == watched
        || (path.starts_with(watched) && path.as_bytes().get(watched.len()) == Some(&b'/'))
        || (watched.starts_with(path) && watched.as_bytes().get(path.len()) == Some(&b'/'))
}

fn in_subtree(root: &str, path: &str) -> bool {
    path == root || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

// ───────────────────────────────────────────────────────────────────
// In-process store
// ───────────────────────────────────────────────────────────────────

struct Watcher {
    path: String,
    hub: EventHub<StoreSnapshot>,
}

struct LinkEntry {
    on_disconnect: Vec<String>,
    watchers: Vec<Watcher>,
    events: EventHub<LinkEvent>,
}

struct StoreState {
    available: bool,
    next_link: LinkId,
    values: BTreeMap<String, Vec<u8>>,
    links: HashMap<LinkId, LinkEntry>,
}

impl StoreState {
    fn check(&self, link: LinkId) -> Result<(), StoreError> {
        if !self.available {
            return Err(StoreError::Unavailable);
        }
        if !self.links.contains_key(&link) {
            return Err(StoreError::LinkClosed(link));
        }
        Ok(())
    }

    fn subtree(&self, root: &str) -> StoreSnapshot {
        self.values
            .range(root.to_string()..)
            .take_while(|(key, _)| key.starts_with(root))
            .filter(|(key, _)| in_subtree(root, key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn remove_subtree(&mut self, root: &str) -> bool {
        let doomed: Vec<String> = self
            .values
            .keys()
            .filter(|key| in_subtree(root, key))
            .cloned()
            .collect();
        for key in &doomed {
            self.values.remove(key);
        }
        !doomed.is_empty()
    }

    fn notify(&mut self, changed: &str) {
        let mut deliveries = Vec::new();
        for entry in self.links.values_mut() {
            entry.watchers.retain(|w| w.hub.subscriber_count() > 0);
            for watcher in &entry.watchers {
                if covers(&watcher.path, changed) {
                    deliveries.push((watcher.hub.clone(), watcher.path.clone()));
                }
            }
        }
        for (hub, path) in deliveries {
            hub.emit(self.subtree(&path));
        }
    }

    /// Drop a link, running its disconnect removals.
    fn end_link(&mut self, link: LinkId) -> Option<LinkEntry> {
        let entry = self.links.remove(&link)?;
        for path in &entry.on_disconnect {
            if self.remove_subtree(path) {
                self.notify(path);
            }
        }
        Some(entry)
    }
}

/// In-memory [`SharedStore`] shared by every client in the process.
///
/// Besides the store operations it can simulate failures:
/// [`sever_link`](Self::sever_link) drops one client, and
/// [`set_available`](Self::set_available) takes the whole store offline.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                available: true,
                next_link: 1,
                values: BTreeMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop `link` as if its network went away.
    pub fn sever_link(&self, link: LinkId) -> bool {
        let entry = self.state().end_link(link);
        match entry {
            Some(entry) => {
                log::info!("Link {} severed", link);
                entry.events.emit(LinkEvent::Lost {
                    reason: "link severed".into(),
                });
                true
            }
            None => false,
        }
    }

    /// Take the store offline (severing every link) or bring it back.
    pub fn set_available(&self, available: bool) {
        let severed: Vec<LinkEntry> = {
            let mut state = self.state();
            state.available = available;
            if available {
                Vec::new()
            } else {
                let ids: Vec<LinkId> = state.links.keys().copied().collect();
                ids.into_iter().filter_map(|id| state.end_link(id)).collect()
            }
        };
        log::info!(
            "Store {} ({} links severed)",
            if available { "available" } else { "unavailable" },
            severed.len()
        );
        for entry in severed {
            entry.events.emit(LinkEvent::Lost {
                reason: "store unavailable".into(),
            });
        }
    }

    pub fn is_available(&self) -> bool {
        self.state().available
    }

    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    /// Raw record at `path`, bypassing links.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state().values.get(path).cloned()
    }

    /// Every stored path, in order.
    pub fn keys(&self) -> Vec<String> {
        self.state().values.keys().cloned().collect()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn open_link(&self) -> Result<LinkId, StoreError> {
        let mut state = self.state();
        if !state.available {
            return Err(StoreError::Unavailable);
        }
        let id = state.next_link;
        state.next_link += 1;
        state.links.insert(
            id,
            LinkEntry {
                on_disconnect: Vec::new(),
                watchers: Vec::new(),
                events: EventHub::new(),
            },
        );
        log::debug!("Link {} opened", id);
        Ok(id)
    }

    async fn close_link(&self, link: LinkId) {
        if self.state().end_link(link).is_some() {
            log::debug!("Link {} closed", link);
        }
    }

    async fn read(&self, link: LinkId, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.state();
        state.check(link)?;
        Ok(state.values.get(path).cloned())
    }

    async fn read_tree(&self, link: LinkId, path: &str) -> Result<StoreSnapshot, StoreError> {
        let state = self.state();
        state.check(link)?;
        Ok(state.subtree(path))
    }

    async fn write(&self, link: LinkId, path: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check(link)?;
        if state.values.get(path) == Some(&value) {
            return Ok(());
        }
        state.values.insert(path.to_string(), value);
        state.notify(path);
        Ok(())
    }

    async fn remove(&self, link: LinkId, path: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check(link)?;
        if state.remove_subtree(path) {
            state.notify(path);
        }
        Ok(())
    }

    async fn remove_on_disconnect(&self, link: LinkId, path: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check(link)?;
        if let Some(entry) = state.links.get_mut(&link) {
            if !entry.on_disconnect.iter().any(|p| p == path) {
                entry.on_disconnect.push(path.to_string());
            }
        }
        Ok(())
    }

    fn watch(&self, link: LinkId, path: &str) -> Subscription<StoreSnapshot> {
        let mut state = self.state();
        let snapshot = state.subtree(path);
        match state.links.get_mut(&link) {
            Some(entry) => {
                let hub = EventHub::new();
                let subscription = hub.subscribe();
                hub.emit(snapshot);
                entry.watchers.push(Watcher {
                    path: path.to_string(),
                    hub,
                });
                subscription
            }
            None => Subscription::closed(),
        }
    }

    fn link_events(&self, link: LinkId) -> Subscription<LinkEvent> {
        match self.state().links.get(&link) {
            Some(entry) => entry.events.subscribe(),
            None => Subscription::closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use hozo_core::{Concept, Point};
    use uuid::Uuid;

    #[test]
    fn test_paths() {
        let session = SessionId::new("s1");
        let user = Uuid::nil();
        assert_eq!(paths::document(&session), "sessions/s1/document");
        assert_eq!(
            paths::cursor(&session, &user),
            format!("sessions/s1/cursors/{}", user)
        );
        assert_eq!(paths::leaf(&paths::user(&session, &user)), user.to_string());
    }

    #[test]
    fn test_covers() {
        assert!(covers("sessions/a/users", "sessions/a/users/u1"));
        assert!(covers("sessions/a/users/u1", "sessions/a/users"));
        assert!(covers("sessions/a/document", "sessions/a/document"));
        assert!(!covers("sessions/a/users", "sessions/a/usersX"));
        assert!(!covers("sessions/a/users", "sessions/a/cursors/u1"));
    }

    #[test]
    fn test_document_record_round_trip() {
        let mut doc = OntologyDocument::new("a.xml", "d1");
        doc.concepts.push(Concept::new("1", "Animal", Point::new(1.5, -2.0)));
        let record = DocumentRecord {
            stamp: Some(WriteStamp {
                writer: Uuid::new_v4(),
                seq: 7,
            }),
            document: doc,
        };
        let bytes = encode_record(&record).unwrap();
        let back: DocumentRecord = decode_record(&bytes).unwrap();
        assert_eq!(back, record);
        assert!(decode_record::<DocumentRecord>(&[0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let store = MemoryStore::new();
        let link = store.open_link().await.unwrap();

        store.write(link, "a/b", vec![1]).await.unwrap();
        store.write(link, "a/c", vec![2]).await.unwrap();
        assert_eq!(store.read(link, "a/b").await.unwrap(), Some(vec![1]));
        assert_eq!(store.read_tree(link, "a").await.unwrap().len(), 2);

        store.remove(link, "a").await.unwrap();
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_watch_fires_immediately_and_on_change() {
        let store = MemoryStore::new();
        let link = store.open_link().await.unwrap();
        store.write(link, "s/users/u1", vec![1]).await.unwrap();

        let mut watch = store.watch(link, "s/users");
        assert_eq!(watch.recv().await.unwrap().len(), 1);

        store.write(link, "s/users/u2", vec![2]).await.unwrap();
        assert_eq!(watch.recv().await.unwrap().len(), 2);

        store.write(link, "s/document", vec![9]).await.unwrap();
        assert!(watch.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_sever_runs_disconnect_removals_and_reports_loss() {
        let store = MemoryStore::new();
        let alice = store.open_link().await.unwrap();
        let bob = store.open_link().await.unwrap();

        store.write(alice, "s/users/alice", vec![1]).await.unwrap();
        store.remove_on_disconnect(alice, "s/users/alice").await.unwrap();

        let mut bob_watch = store.watch(bob, "s/users");
        assert_eq!(bob_watch.recv().await.unwrap().len(), 1);
        let mut alice_events = store.link_events(alice);

        assert!(store.sever_link(alice));
        assert!(bob_watch.recv().await.unwrap().is_empty());
        assert!(matches!(alice_events.recv().await, Some(LinkEvent::Lost { .. })));
        assert_eq!(
            store.write(alice, "s/x", vec![0]).await,
            Err(StoreError::LinkClosed(alice))
        );
    }

    #[tokio::test]
    async fn test_close_link_is_quiet() {
        let store = MemoryStore::new();
        let link = store.open_link().await.unwrap();
        store.write(link, "s/users/u", vec![1]).await.unwrap();
        store.remove_on_disconnect(link, "s/users/u").await.unwrap();
        let mut events = store.link_events(link);

        store.close_link(link).await;
        assert!(store.get("s/users/u").is_none());
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_outage_blocks_new_links() {
        let store = MemoryStore::new();
        let link = store.open_link().await.unwrap();
        let mut events = store.link_events(link);

        store.set_available(false);
        assert!(matches!(events.recv().await, Some(LinkEvent::Lost { .. })));
        assert_eq!(store.open_link().await, Err(StoreError::Unavailable));
        assert_eq!(store.link_count(), 0);

        store.set_available(true);
        assert!(store.open_link().await.is_ok());
    }
}
