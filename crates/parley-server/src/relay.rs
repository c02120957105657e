use std::sync::Arc;

use tracing::{debug, instrument};

use parley_core::errors::RelayError;
use parley_core::identity::Identity;
use parley_core::ids::{MessageId, VisitorId};
use parley_core::message::{ChatMessage, MessageKind};
use parley_core::traits::MessageStore;
use parley_core::wire::ServerFrame;

use crate::presence::PresenceRegistry;

/// An inbound chat payload, decoded from the wire but not yet resolved
/// into a message.
#[derive(Clone, Debug)]
pub struct InboundChat {
    pub id: Option<MessageId>,
    pub content: String,
    pub kind: MessageKind,
    pub recipient_id: Option<VisitorId>,
}

/// What happened to a relayed message. Persisted in both cases; the
/// sender is acked in both cases.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Persisted and forwarded to an online recipient.
    Delivered(ChatMessage),
    /// Persisted; recipient offline, will see it on next history load.
    Stored(ChatMessage),
}

impl RelayOutcome {
    pub fn message(&self) -> &ChatMessage {
        match self {
            Self::Delivered(m) | Self::Stored(m) => m,
        }
    }
}

/// Routes inbound messages: resolve recipient, persist, then forward to
/// the recipient's live connection if it has one. Persist-before-forward
/// so every forwarded message is already durable.
pub struct RelayRouter {
    store: Arc<dyn MessageStore>,
    presence: Arc<PresenceRegistry>,
}

impl RelayRouter {
    pub fn new(store: Arc<dyn MessageStore>, presence: Arc<PresenceRegistry>) -> Self {
        Self { store, presence }
    }

    /// Resolve the recipient of a payload. Visitors always talk to their
    /// linked agent; agents must name a recipient visitor.
    fn resolve_recipient(
        &self,
        sender: &Identity,
        inbound: &InboundChat,
    ) -> Result<Identity, RelayError> {
        match sender {
            Identity::Visitor { agent_id, .. } => Ok(Identity::agent(agent_id.clone())),
            Identity::Agent { id } => match &inbound.recipient_id {
                Some(visitor_id) => Ok(Identity::visitor(visitor_id.clone(), id.clone())),
                None => Err(RelayError::Validation(
                    "agent messages require a recipient_id".into(),
                )),
            },
        }
    }

    #[instrument(skip(self, inbound), fields(sender = %sender))]
    pub async fn relay(
        &self,
        sender: &Identity,
        inbound: InboundChat,
    ) -> Result<RelayOutcome, RelayError> {
        let recipient = self.resolve_recipient(sender, &inbound)?;

        let message = ChatMessage::new(
            inbound.id.unwrap_or_default(),
            sender.clone(),
            recipient.clone(),
            inbound.kind,
            inbound.content,
        );

        // Persist first; on failure nothing is forwarded and the sender
        // gets an explicit error rather than a silent drop.
        self.store.append(&message).await?;

        let delivered = match self.presence.lookup(&recipient) {
            Some(handle) => handle.send(ServerFrame::MessageReceived {
                id: message.id.clone(),
                content: message.content.clone(),
                kind: message.kind,
                sender_id: sender.id_str().to_string(),
                timestamp: message.created_at,
            }),
            None => false,
        };

        debug!(message_id = %message.id, recipient = %recipient, delivered, "relayed");

        if delivered {
            Ok(RelayOutcome::Delivered(message))
        } else {
            Ok(RelayOutcome::Stored(message))
        }
    }
}
