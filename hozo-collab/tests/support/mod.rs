//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hozo_collab::presence::{PresenceEvent, PresenceUpdate, UserId, UserPresence};
use hozo_collab::subscription::{EventHub, Subscription};
use hozo_collab::transport::{
    DocumentChange, JoinAccepted, JoinError, JoinGate, JoinRequest, JoinTicket, LinkEvent,
    Transport, TransportError,
};
use hozo_core::{Concept, IsaEdge, OntologyDocument, Operation, Point};

/// Two concepts joined by one is-a edge.
pub fn sample_document() -> OntologyDocument {
    let mut doc = OntologyDocument::new("animals.xml", "doc-1");
    doc.concepts.push(Concept::new("1", "Animal", Point::new(0.0, 0.0)));
    doc.concepts.push(Concept::new("2", "Dog", Point::new(0.0, 100.0)));
    doc.isa_links.push(IsaEdge::new("e1", "1", "2"));
    doc
}

pub fn accepted(user_id: UserId, name: &str, document: OntologyDocument) -> JoinAccepted {
    JoinAccepted {
        local_user_id: user_id,
        color: "#3366cc".into(),
        document,
        users: vec![UserPresence::new(user_id, name, "#3366cc")],
    }
}

#[derive(Default)]
struct Script {
    joins: VecDeque<(Duration, Result<JoinAccepted, JoinError>)>,
    requests: Vec<JoinRequest>,
    submitted: Vec<Operation>,
    presence: Vec<PresenceUpdate>,
    leaves: usize,
    fail_submit: bool,
}

/// A transport whose join results are queued by the test and whose
/// outbound traffic is recorded.
pub struct ScriptedTransport {
    documents: EventHub<DocumentChange>,
    presence: EventHub<PresenceEvent>,
    link: EventHub<LinkEvent>,
    gate: JoinGate,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            documents: EventHub::new(),
            presence: EventHub::new(),
            link: EventHub::new(),
            gate: JoinGate::new(),
            script: Mutex::new(Script::default()),
        })
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Queue the result of the next join.
    pub fn push_join(&self, result: Result<JoinAccepted, JoinError>) {
        self.push_join_after(Duration::ZERO, result);
    }

    /// Queue a join result delivered after `delay`.
    pub fn push_join_after(&self, delay: Duration, result: Result<JoinAccepted, JoinError>) {
        self.script().joins.push_back((delay, result));
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.script().fail_submit = fail;
    }

    pub fn requests(&self) -> Vec<JoinRequest> {
        self.script().requests.clone()
    }

    pub fn submitted(&self) -> Vec<Operation> {
        self.script().submitted.clone()
    }

    pub fn presence_updates(&self) -> Vec<PresenceUpdate> {
        self.script().presence.clone()
    }

    pub fn leaves(&self) -> usize {
        self.script().leaves
    }

    pub fn emit_change(&self, change: DocumentChange) {
        self.documents.emit(change);
    }

    pub fn emit_presence(&self, event: PresenceEvent) {
        self.presence.emit(event);
    }

    pub fn emit_lost(&self, reason: &str) {
        self.link.emit(LinkEvent::Lost {
            reason: reason.into(),
        });
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn begin_join(&self) -> JoinTicket {
        self.gate.issue()
    }

    async fn join(
        &self,
        ticket: JoinTicket,
        request: JoinRequest,
    ) -> Result<JoinAccepted, JoinError> {
        if !self.gate.admits(ticket) {
            return Err(JoinError::TransportUnavailable("join superseded".into()));
        }
        let next = {
            let mut script = self.script();
            script.requests.push(request);
            script.joins.pop_front()
        };
        match next {
            Some((delay, result)) => {
                tokio::time::sleep(delay).await;
                result
            }
            None => Err(JoinError::TransportUnavailable("no scripted result".into())),
        }
    }

    async fn submit_operation(
        &self,
        operation: &Operation,
        _document: &OntologyDocument,
    ) -> Result<(), TransportError> {
        let mut script = self.script();
        if script.fail_submit {
            return Err(TransportError::NotConnected);
        }
        script.submitted.push(operation.clone());
        Ok(())
    }

    fn subscribe_document_changes(&self) -> Subscription<DocumentChange> {
        self.documents.subscribe()
    }

    async fn publish_presence(&self, update: PresenceUpdate) -> Result<(), TransportError> {
        self.script().presence.push(update);
        Ok(())
    }

    fn subscribe_presence(&self) -> Subscription<PresenceEvent> {
        self.presence.subscribe()
    }

    fn subscribe_link(&self) -> Subscription<LinkEvent> {
        self.link.subscribe()
    }

    async fn leave(&self) -> Result<(), TransportError> {
        self.gate.close();
        self.script().leaves += 1;
        Ok(())
    }
}
