//! The operation applier.
//!
//! One function mutates a document for both optimistic local edits and
//! replayed remote edits. It is total: an operation whose target is gone
//! (typically because it raced with a delete) changes nothing and reports
//! [`ApplyOutcome::TargetMissing`]. Callers log that at most; it is never
//! an error.
//!
//! Not checked here: label uniqueness, slot shape, graph acyclicity,
//! referential integrity of new edges.

use crate::model::OntologyDocument;
use crate::operation::Operation;

/// What an [`apply`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document changed.
    Applied,
    /// An add reused an existing id; the entry was overwritten in place.
    Replaced,
    /// The target id was absent. Nothing changed.
    TargetMissing,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::TargetMissing)
    }
}

/// Apply one operation in place.
pub fn apply(doc: &mut OntologyDocument, op: &Operation) -> ApplyOutcome {
    let outcome = match op {
        Operation::AddConcept { concept } => match doc.concept_mut(&concept.id) {
            Some(existing) => {
                *existing = concept.clone();
                ApplyOutcome::Replaced
            }
            None => {
                doc.concepts.push(concept.clone());
                ApplyOutcome::Applied
            }
        },

        Operation::UpdateConcept {
            concept_id,
            changes,
        } => match doc.concept_mut(concept_id) {
            Some(concept) => {
                changes.apply_to(concept);
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::TargetMissing,
        },

        Operation::DeleteConcept { concept_id } => match doc.concept_index(concept_id) {
            Some(index) => {
                let removed = doc.concepts.remove(index);
                // Cascade after removal so a label endpoint is only treated
                // as a label when no surviving concept has it as an id.
                let survivors = &doc.concepts;
                doc.isa_links.retain(|edge| {
                    !edge.endpoints().iter().any(|ep| {
                        *ep == removed.id
                            || (*ep == removed.label && !survivors.iter().any(|c| c.id == *ep))
                    })
                });
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::TargetMissing,
        },

        Operation::MoveConcept {
            concept_id,
            position,
        } => match doc.concept_mut(concept_id) {
            Some(concept) => {
                concept.position = *position;
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::TargetMissing,
        },

        Operation::AddIsa { isa } => match doc.isa_links.iter_mut().find(|e| e.id == isa.id) {
            Some(existing) => {
                *existing = isa.clone();
                ApplyOutcome::Replaced
            }
            None => {
                doc.isa_links.push(isa.clone());
                ApplyOutcome::Applied
            }
        },

        Operation::DeleteIsa { isa_id } => match doc.isa_link_index(isa_id) {
            Some(index) => {
                doc.isa_links.remove(index);
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::TargetMissing,
        },
    };

    if outcome == ApplyOutcome::TargetMissing {
        log::debug!("Ignored {} for absent target {}", op.kind(), op.target_id());
    }
    outcome
}

/// Apply operations in order. Returns how many changed the document.
pub fn apply_all<'a, I>(doc: &mut OntologyDocument, ops: I) -> usize
where
    I: IntoIterator<Item = &'a Operation>,
{
    ops.into_iter().filter(|op| apply(doc, op).changed()).count()
}
