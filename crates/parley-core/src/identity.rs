use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, VisitorId};

/// Who is on the other end of a connection. Bound once at handshake and
/// immutable for the connection's lifetime.
///
/// A visitor always belongs to exactly one agent; the association comes
/// from the share link resolved during authentication and travels with
/// the identity so recipient resolution stays exhaustive.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Identity {
    Agent { id: AgentId },
    Visitor { id: VisitorId, agent_id: AgentId },
}

/// Declared role in an auth frame, before an identity is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Visitor,
}

impl Identity {
    pub fn agent(id: AgentId) -> Self {
        Self::Agent { id }
    }

    pub fn visitor(id: VisitorId, agent_id: AgentId) -> Self {
        Self::Visitor { id, agent_id }
    }

    /// Opaque string id, usable as a registry/storage key.
    pub fn id_str(&self) -> &str {
        match self {
            Self::Agent { id } => id.as_str(),
            Self::Visitor { id, .. } => id.as_str(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Agent { .. } => Role::Agent,
            Self::Visitor { .. } => Role::Visitor,
        }
    }

    /// The agent side of this identity's chat relationship: itself for
    /// an agent, the owning agent for a visitor.
    pub fn owning_agent(&self) -> &AgentId {
        match self {
            Self::Agent { id } => id,
            Self::Visitor { agent_id, .. } => agent_id,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id_str())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Visitor => write!(f, "visitor"),
        }
    }
}
