//! Seams to the relay's external collaborators. The server takes these
//! as trait objects so storage and credential policy stay substitutable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::RelayError;
use crate::identity::{Identity, Role};
use crate::ids::AgentId;
use crate::message::ChatMessage;

/// Answers "is this credential currently valid, and what identity does
/// it grant". Key issuance and expiry policy live behind this seam.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Resolve a credential to an identity. `identity_hint` lets a
    /// returning visitor keep its previous id across connections.
    async fn validate(
        &self,
        role: Role,
        credential: &str,
        identity_hint: Option<&str>,
    ) -> Result<Identity, RelayError>;
}

/// A share link mapping a visitor entry point to its owning agent.
#[derive(Clone, Debug, PartialEq)]
pub struct ShareLink {
    pub agent_id: AgentId,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl ShareLink {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Resolves a share-link code to its agent association, if any.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn resolve(&self, code: &str) -> Result<Option<ShareLink>, RelayError>;
}

/// Records when an identity was last connected. Written at session
/// teardown, surfaced in offline presence notifications.
#[async_trait]
pub trait LastSeenStore: Send + Sync {
    async fn record(&self, identity: &Identity, at: DateTime<Utc>) -> Result<(), RelayError>;
}

/// Durable, append-only record of chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. Must be idempotent on the message id so a
    /// re-sent message never duplicates history.
    async fn append(&self, message: &ChatMessage) -> Result<(), RelayError>;

    /// Full history between two identities, both directions, in
    /// insertion order.
    async fn query_history(
        &self,
        a: &Identity,
        b: &Identity,
    ) -> Result<Vec<ChatMessage>, RelayError>;
}
