//! In-memory ontology document.
//!
//! The JSON shape produced by serde matches what the document codec emits:
//!
//! ```text
//! { "filename": "animals.xml", "documentId": "...",
//!   "concepts": [ { "id", "label", "position": {x,y}, "slots": [...] } ],
//!   "isaLinks": [ { "id", "parent", "child" } ] }
//! ```
//!
//! Edge endpoints are concept ids. Documents decoded from older files may
//! still name endpoints by label; [`OntologyDocument::resolve_endpoint`]
//! falls back to a label lookup when no concept has that id, and
//! [`OntologyDocument::normalize_links`] rewrites such endpoints to ids.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ConceptId = String;
pub type EdgeId = String;

/// Position in document coordinates (not viewport space).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A role slot on a concept. The engine never inspects these.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub role: String,
    #[serde(default)]
    pub class_constraint: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub cardinality: Option<String>,
}

/// A labeled node in the ontology graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,
    pub label: String,
    #[serde(default)]
    pub position: Point,
    #[serde(default)]
    pub slots: Vec<Slot>,
}

impl Concept {
    pub fn new(id: impl Into<ConceptId>, label: impl Into<String>, position: Point) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            position,
            slots: Vec::new(),
        }
    }

    pub fn with_slots(mut self, slots: Vec<Slot>) -> Self {
        self.slots = slots;
        self
    }
}

/// Directed "is-a" relation: `child` is-a `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsaEdge {
    pub id: EdgeId,
    pub parent: String,
    pub child: String,
}

impl IsaEdge {
    pub fn new(
        id: impl Into<EdgeId>,
        parent: impl Into<String>,
        child: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent: parent.into(),
            child: child.into(),
        }
    }

    pub fn endpoints(&self) -> [&str; 2] {
        [self.parent.as_str(), self.child.as_str()]
    }
}

/// The shared document: concepts, is-a edges and identifying metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OntologyDocument {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub isa_links: Vec<IsaEdge>,
}

impl OntologyDocument {
    pub fn new(filename: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            document_id: document_id.into(),
            concepts: Vec::new(),
            isa_links: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn concept(&self, id: &str) -> Option<&Concept> {
        self.concepts.iter().find(|c| c.id == id)
    }

    pub fn concept_mut(&mut self, id: &str) -> Option<&mut Concept> {
        self.concepts.iter_mut().find(|c| c.id == id)
    }

    pub fn concept_index(&self, id: &str) -> Option<usize> {
        self.concepts.iter().position(|c| c.id == id)
    }

    pub fn has_concept(&self, id: &str) -> bool {
        self.concept_index(id).is_some()
    }

    pub fn isa_link(&self, id: &str) -> Option<&IsaEdge> {
        self.isa_links.iter().find(|e| e.id == id)
    }

    pub fn isa_link_index(&self, id: &str) -> Option<usize> {
        self.isa_links.iter().position(|e| e.id == id)
    }

    /// Resolve an edge endpoint to a concept: by id first, then by label.
    pub fn resolve_endpoint(&self, endpoint: &str) -> Option<&Concept> {
        self.concept(endpoint)
            .or_else(|| self.concepts.iter().find(|c| c.label == endpoint))
    }

    /// Display label for an endpoint, as a renderer would draw it.
    pub fn endpoint_label(&self, endpoint: &str) -> Option<&str> {
        self.resolve_endpoint(endpoint).map(|c| c.label.as_str())
    }

    /// Whether `endpoint` names `concept`, either by id or, when it matches
    /// no concept id in this document, by label.
    pub fn endpoint_names(&self, endpoint: &str, concept: &Concept) -> bool {
        endpoint == concept.id || (endpoint == concept.label && !self.has_concept(endpoint))
    }

    /// Edges attached to the concept with the given id.
    pub fn links_of(&self, concept_id: &str) -> Vec<&IsaEdge> {
        let Some(concept) = self.concept(concept_id) else {
            return Vec::new();
        };
        self.isa_links
            .iter()
            .filter(|e| e.endpoints().iter().any(|ep| self.endpoint_names(ep, concept)))
            .collect()
    }

    /// Concept ids that occur more than once.
    pub fn duplicate_concept_ids(&self) -> Vec<ConceptId> {
        let mut seen = HashSet::new();
        let mut dupes = Vec::new();
        for concept in &self.concepts {
            if !seen.insert(concept.id.as_str()) && !dupes.contains(&concept.id) {
                dupes.push(concept.id.clone());
            }
        }
        dupes
    }

    /// Edges with an endpoint that resolves to no concept. Legal, but they
    /// cannot be drawn.
    pub fn dangling_links(&self) -> Vec<&IsaEdge> {
        self.isa_links
            .iter()
            .filter(|e| e.endpoints().iter().any(|ep| self.resolve_endpoint(ep).is_none()))
            .collect()
    }

    /// Rewrite label-valued endpoints to concept ids where the label is
    /// carried by exactly one concept. Returns the number of endpoints
    /// rewritten.
    pub fn normalize_links(&mut self) -> usize {
        let ids: HashSet<&str> = self.concepts.iter().map(|c| c.id.as_str()).collect();
        let mut by_label: HashMap<&str, Option<&str>> = HashMap::new();
        for concept in &self.concepts {
            by_label
                .entry(concept.label.as_str())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(concept.id.as_str()));
        }

        let mut rewrites: Vec<(usize, bool, String)> = Vec::new();
        for (index, edge) in self.isa_links.iter().enumerate() {
            for (is_parent, endpoint) in [(true, &edge.parent), (false, &edge.child)] {
                if ids.contains(endpoint.as_str()) {
                    continue;
                }
                if let Some(Some(id)) = by_label.get(endpoint.as_str()) {
                    rewrites.push((index, is_parent, (*id).to_string()));
                }
            }
        }

        let count = rewrites.len();
        for (index, is_parent, id) in rewrites {
            let edge = &mut self.isa_links[index];
            if is_parent {
                edge.parent = id;
            } else {
                edge.child = id;
            }
        }
        if count > 0 {
            log::debug!(
                "Normalized {count} label endpoints to concept ids in {}",
                self.filename
            );
        }
        count
    }
}

/// Fresh globally unique concept id.
pub fn new_concept_id() -> ConceptId {
    format!("n{}", Uuid::new_v4().simple())
}

/// Fresh globally unique edge id.
pub fn new_edge_id() -> EdgeId {
    format!("e{}", Uuid::new_v4().simple())
}
