//! # hozo-core: Ontology document model for collaborative editing
//!
//! Pure data and deterministic mutation. Everything that touches the
//! network lives in `hozo-collab`; this crate only knows what a document
//! looks like and how one [`Operation`] changes it.
//!
//! ## Modules
//!
//! - [`model`]: [`OntologyDocument`], [`Concept`], [`IsaEdge`], [`Slot`]
//! - [`operation`]: the closed set of document mutations
//! - [`apply`]: the applier shared by local and remote edits
//!
//! ```text
//! UI intent ──► Operation ──► apply(&mut doc, &op)
//!                                  ▲
//! remote op ───────────────────────┘
//! ```

pub mod apply;
pub mod model;
pub mod operation;

pub use apply::{apply, apply_all, ApplyOutcome};
pub use model::{
    new_concept_id, new_edge_id, Concept, ConceptId, EdgeId, IsaEdge, OntologyDocument, Point,
    Slot,
};
pub use operation::{ConceptChanges, Operation, OperationKind};
