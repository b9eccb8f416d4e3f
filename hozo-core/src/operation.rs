//! Document operations: the unit of synchronization.
//!
//! Each variant carries only the delta it needs. On the relay wire an
//! operation is a JSON object with a `type` discriminant:
//!
//! ```text
//! {"type":"move-concept","conceptId":"n1","position":{"x":40,"y":12}}
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{Concept, ConceptId, EdgeId, IsaEdge, Point, Slot};

/// Partial concept fields carried by `update-concept`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConceptChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<Vec<Slot>>,
}

impl ConceptChanges {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.position.is_none() && self.slots.is_none()
    }

    /// Overwrite each present field on `concept`.
    pub fn apply_to(&self, concept: &mut Concept) {
        if let Some(label) = &self.label {
            concept.label = label.clone();
        }
        if let Some(position) = self.position {
            concept.position = position;
        }
        if let Some(slots) = &self.slots {
            concept.slots = slots.clone();
        }
    }
}

/// A single document mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Operation {
    AddConcept {
        concept: Concept,
    },
    UpdateConcept {
        concept_id: ConceptId,
        changes: ConceptChanges,
    },
    DeleteConcept {
        concept_id: ConceptId,
    },
    MoveConcept {
        concept_id: ConceptId,
        position: Point,
    },
    AddIsa {
        isa: IsaEdge,
    },
    DeleteIsa {
        isa_id: EdgeId,
    },
}

/// Discriminant of [`Operation`], for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    AddConcept,
    UpdateConcept,
    DeleteConcept,
    MoveConcept,
    AddIsa,
    DeleteIsa,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::AddConcept => "add-concept",
            OperationKind::UpdateConcept => "update-concept",
            OperationKind::DeleteConcept => "delete-concept",
            OperationKind::MoveConcept => "move-concept",
            OperationKind::AddIsa => "add-isa",
            OperationKind::DeleteIsa => "delete-isa",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn add_concept(concept: Concept) -> Self {
        Operation::AddConcept { concept }
    }

    pub fn update_concept(concept_id: impl Into<ConceptId>, changes: ConceptChanges) -> Self {
        Operation::UpdateConcept {
            concept_id: concept_id.into(),
            changes,
        }
    }

    pub fn rename_concept(concept_id: impl Into<ConceptId>, label: impl Into<String>) -> Self {
        Self::update_concept(concept_id, ConceptChanges::label(label))
    }

    pub fn delete_concept(concept_id: impl Into<ConceptId>) -> Self {
        Operation::DeleteConcept {
            concept_id: concept_id.into(),
        }
    }

    pub fn move_concept(concept_id: impl Into<ConceptId>, position: Point) -> Self {
        Operation::MoveConcept {
            concept_id: concept_id.into(),
            position,
        }
    }

    pub fn add_isa(isa: IsaEdge) -> Self {
        Operation::AddIsa { isa }
    }

    pub fn delete_isa(isa_id: impl Into<EdgeId>) -> Self {
        Operation::DeleteIsa {
            isa_id: isa_id.into(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::AddConcept { .. } => OperationKind::AddConcept,
            Operation::UpdateConcept { .. } => OperationKind::UpdateConcept,
            Operation::DeleteConcept { .. } => OperationKind::DeleteConcept,
            Operation::MoveConcept { .. } => OperationKind::MoveConcept,
            Operation::AddIsa { .. } => OperationKind::AddIsa,
            Operation::DeleteIsa { .. } => OperationKind::DeleteIsa,
        }
    }

    /// Id of the concept or edge this operation targets.
    pub fn target_id(&self) -> &str {
        match self {
            Operation::AddConcept { concept } => &concept.id,
            Operation::UpdateConcept { concept_id, .. }
            | Operation::DeleteConcept { concept_id }
            | Operation::MoveConcept { concept_id, .. } => concept_id,
            Operation::AddIsa { isa } => &isa.id,
            Operation::DeleteIsa { isa_id } => isa_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_tags_are_kebab_case() {
        let op = Operation::move_concept("n1", Point::new(40.0, 12.0));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({"type": "move-concept", "conceptId": "n1", "position": {"x": 40.0, "y": 12.0}})
        );

        let value = serde_json::to_value(Operation::delete_isa("e7")).unwrap();
        assert_eq!(value, json!({"type": "delete-isa", "isaId": "e7"}));
    }

    #[test]
    fn test_decode_browser_update_concept() {
        let raw = r#"{"type":"update-concept","conceptId":"n9","changes":{"label":"Cat"}}"#;
        let op: Operation = serde_json::from_str(raw).unwrap();
        assert_eq!(op, Operation::rename_concept("n9", "Cat"));
        assert_eq!(op.kind(), OperationKind::UpdateConcept);
        assert_eq!(op.target_id(), "n9");
    }

    #[test]
    fn test_decode_add_isa() {
        let raw = r#"{"type":"add-isa","isa":{"id":"e1","parent":"1","child":"2"}}"#;
        let op: Operation = serde_json::from_str(raw).unwrap();
        assert_eq!(op, Operation::add_isa(IsaEdge::new("e1", "1", "2")));
        assert_eq!(op.kind().to_string(), "add-isa");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"rotate-concept","conceptId":"n1"}"#;
        assert!(serde_json::from_str::<Operation>(raw).is_err());
    }

    #[test]
    fn test_empty_changes_serialize_compactly() {
        let op = Operation::update_concept("n1", ConceptChanges::default());
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["changes"], json!({}));
        assert!(ConceptChanges::default().is_empty());
    }

    #[test]
    fn test_changes_apply_only_present_fields() {
        let mut concept = Concept::new("n1", "Dog", Point::new(1.0, 2.0));
        let changes = ConceptChanges {
            position: Some(Point::new(5.0, 6.0)),
            ..ConceptChanges::default()
        };
        changes.apply_to(&mut concept);
        assert_eq!(concept.label, "Dog");
        assert_eq!(concept.position, Point::new(5.0, 6.0));
    }
}
