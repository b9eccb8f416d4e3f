//! JSON protocol spoken between session clients and the relay server.
//!
//! Every frame is a WebSocket text message holding one JSON object with a
//! kebab-case `type` discriminant and camelCase fields:
//!
//! ```text
//! client ─► relay   join | operation | cursor
//! relay  ─► client  joined | error | user-joined | user-left
//!                   | operation | cursor-update
//! ```
//!
//! The relay never forwards a client's own `operation` or `cursor` back to
//! it.

use hozo_core::{OntologyDocument, Operation, Point};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionId;

/// Relay-side identity of a joined user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: Uuid,
    pub user_name: String,
    /// `#rrggbb`
    pub color: String,
}

/// Machine-readable reason attached to an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionFull,
    BadRequest,
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join `session_id`, creating it from `ontology` when it does not exist.
    Join {
        session_id: SessionId,
        user_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ontology: Option<OntologyDocument>,
    },
    Operation {
        operation: Operation,
    },
    Cursor {
        cursor: Point,
    },
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Joined {
        user_id: Uuid,
        color: String,
        ontology: OntologyDocument,
        users: Vec<UserInfo>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
    UserJoined {
        user_id: Uuid,
        user_name: String,
        color: String,
    },
    UserLeft {
        user_id: Uuid,
        user_name: String,
    },
    Operation {
        operation: Operation,
    },
    CursorUpdate {
        user_id: Uuid,
        user_name: String,
        color: String,
        cursor: Point,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn user_joined(user: &UserInfo) -> Self {
        ServerMessage::UserJoined {
            user_id: user.user_id,
            user_name: user.user_name.clone(),
            color: user.color.clone(),
        }
    }

    pub fn user_left(user: &UserInfo) -> Self {
        ServerMessage::UserLeft {
            user_id: user.user_id,
            user_name: user.user_name.clone(),
        }
    }

    pub fn cursor_update(user: &UserInfo, cursor: Point) -> Self {
        ServerMessage::CursorUpdate {
            user_id: user.user_id,
            user_name: user.user_name.clone(),
            color: user.color.clone(),
            cursor,
        }
    }
}

macro_rules! json_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to a JSON text frame.
            pub fn encode(&self) -> Result<String, ProtocolError> {
                serde_json::to_string(self)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))
            }

            /// Parse a JSON text frame.
            pub fn decode(text: &str) -> Result<Self, ProtocolError> {
                serde_json::from_str(text)
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))
            }
        }
    };
}

json_codec!(ClientMessage);
json_codec!(ServerMessage);

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use hozo_core::Concept;
    use serde_json::json;

    #[test]
    fn test_join_frame_shape() {
        let msg = ClientMessage::Join {
            session_id: SessionId::new("s1"),
            user_name: "Alice".into(),
            ontology: None,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "join", "sessionId": "s1", "userName": "Alice"}));
    }

    #[test]
    fn test_decode_browser_cursor_frame() {
        let msg = ClientMessage::decode(r#"{"type":"cursor","cursor":{"x":3,"y":4.5}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Cursor { cursor: Point::new(3.0, 4.5) });
    }

    #[test]
    fn test_operation_frame_nests_operation_tag() {
        let msg = ServerMessage::Operation {
            operation: Operation::add_concept(Concept::new("n1", "Dog", Point::ORIGIN)),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "operation");
        assert_eq!(value["operation"]["type"], "add-concept");
        assert_eq!(value["operation"]["concept"]["label"], "Dog");
    }

    #[test]
    fn test_error_code_is_optional() {
        let msg = ServerMessage::decode(r#"{"type":"error","message":"Session not found"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Error {
                message: "Session not found".into(),
                code: None,
            }
        );

        let encoded = ServerMessage::error(ErrorCode::SessionFull, "full").encode().unwrap();
        assert!(encoded.contains(r#""code":"session-full""#));
    }

    #[test]
    fn test_cursor_update_carries_identity() {
        let user = UserInfo {
            user_id: Uuid::new_v4(),
            user_name: "Bob".into(),
            color: "#3366ff".into(),
        };
        let value = serde_json::to_value(ServerMessage::cursor_update(&user, Point::new(1.0, 2.0)))
            .unwrap();
        assert_eq!(value["type"], "cursor-update");
        assert_eq!(value["userName"], "Bob");
        assert_eq!(value["userId"], user.user_id.to_string());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ClientMessage::decode(r#"{"type":"shout"}"#).is_err());
    }
}
