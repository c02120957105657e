use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::ids::MessageId;

/// Payload kind carried by a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    File,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
            Self::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// A chat message as constructed by the relay router: immutable once
/// built, persisted before any live forwarding attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: Identity,
    pub recipient: Identity,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        id: MessageId,
        sender: Identity,
        recipient: Identity,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            sender,
            recipient,
            kind,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AgentId, VisitorId};

    #[test]
    fn kind_display_from_str_roundtrip() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::Audio,
            MessageKind::File,
        ] {
            let parsed: MessageKind = kind.to_string().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!("video".parse::<MessageKind>().is_err());
    }

    #[test]
    fn message_serde_roundtrip() {
        let msg = ChatMessage::new(
            MessageId::new(),
            Identity::visitor(VisitorId::new(), AgentId::new()),
            Identity::agent(AgentId::new()),
            MessageKind::Text,
            "hi",
        );
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, parsed);
    }
}
