use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Role;
use crate::ids::{MessageId, VisitorId};
use crate::message::MessageKind;

/// Frames a client may send over the connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Handshake. Must be the first frame on a fresh connection.
    Auth {
        role: Role,
        credential: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        identity_hint: Option<String>,
    },

    /// A chat payload. `id` is optional: clients may supply their own
    /// (for idempotent re-send), otherwise the router mints one.
    /// `recipient_id` is required for agents, ignored for visitors.
    ChatMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
        content: String,
        kind: MessageKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        recipient_id: Option<VisitorId>,
    },

    /// Heartbeat. Any inbound frame counts as liveness traffic.
    Ping {},
}

/// Frames the server pushes to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted. Agents additionally receive the ids of their
    /// currently-online visitors.
    AuthSuccess {
        identity_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        visitors: Option<Vec<VisitorId>>,
    },

    /// Delivery acknowledgement to the sender — sent whether or not the
    /// recipient was reachable live.
    MessageSent {
        id: MessageId,
        timestamp: DateTime<Utc>,
    },

    /// Live delivery to an online recipient.
    MessageReceived {
        id: MessageId,
        content: String,
        kind: MessageKind,
        sender_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Counterpart went online/offline.
    PresenceChanged {
        identity_id: String,
        online: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen_at: Option<DateTime<Utc>>,
    },

    Pong {},

    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_parses() {
        let json = r#"{"type":"auth","role":"agent","credential":"key_abc"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Auth {
                role,
                credential,
                identity_hint,
            } => {
                assert_eq!(role, Role::Agent);
                assert_eq!(credential, "key_abc");
                assert!(identity_hint.is_none());
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn chat_message_frame_parses_without_recipient() {
        let json = r#"{"type":"chat_message","content":"hi","kind":"text"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::ChatMessage {
                id, recipient_id, ..
            } => {
                assert!(id.is_none());
                assert!(recipient_id.is_none());
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn ping_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping {}));
    }

    #[test]
    fn unknown_frame_rejected() {
        let res: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"definitely_not_a_frame"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn auth_success_omits_visitors_for_visitor_clients() {
        let frame = ServerFrame::AuthSuccess {
            identity_id: "vis_1".into(),
            visitors: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"auth_success\""));
        assert!(!json.contains("visitors"));
    }

    #[test]
    fn message_received_wire_shape() {
        let frame = ServerFrame::MessageReceived {
            id: MessageId::from_raw("msg_1"),
            content: "hello".into(),
            kind: MessageKind::Text,
            sender_id: "vis_1".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "message_received");
        assert_eq!(json["sender_id"], "vis_1");
        assert_eq!(json["kind"], "text");
    }

    #[test]
    fn presence_changed_wire_shape() {
        let frame = ServerFrame::PresenceChanged {
            identity_id: "agent_1".into(),
            online: false,
            last_seen_at: Some(Utc::now()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "presence_changed");
        assert_eq!(json["online"], false);
        assert!(json["last_seen_at"].is_string());
    }

    #[test]
    fn error_frame_roundtrip() {
        let frame = ServerFrame::Error {
            message: "invalid or expired credential".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerFrame::Error { message } => {
                assert_eq!(message, "invalid or expired credential");
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }
}
