use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use parley_core::errors::RelayError;
use parley_core::identity::Identity;
use parley_core::ids::{AgentId, MessageId, VisitorId};
use parley_core::message::{ChatMessage, MessageKind};
use parley_core::traits::MessageStore;

use crate::database::Database;
use crate::error::StoreError;

/// Which way a message travelled within an agent/visitor pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    ToAgent,
    ToVisitor,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::ToAgent => "to_agent",
            Self::ToVisitor => "to_visitor",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "to_agent" => Ok(Self::ToAgent),
            "to_visitor" => Ok(Self::ToVisitor),
            other => Err(StoreError::Database(format!("unknown direction: {other}"))),
        }
    }
}

/// Every stored message pairs exactly one agent with one visitor.
fn pair_of(sender: &Identity, recipient: &Identity) -> Result<(AgentId, VisitorId, Direction), StoreError> {
    match (sender, recipient) {
        (Identity::Visitor { id, agent_id }, Identity::Agent { id: to }) if agent_id == to => {
            Ok((agent_id.clone(), id.clone(), Direction::ToAgent))
        }
        (Identity::Agent { id }, Identity::Visitor { id: vis, agent_id }) if agent_id == id => {
            Ok((id.clone(), vis.clone(), Direction::ToVisitor))
        }
        _ => Err(StoreError::Conflict(
            "message must pair an agent with one of its visitors".into(),
        )),
    }
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message. Idempotent on the message id: a re-sent message
    /// with the same id leaves history unchanged.
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub fn append(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let (agent_id, visitor_id, direction) = pair_of(&message.sender, &message.recipient)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO messages (id, agent_id, visitor_id, direction, kind, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message.id.as_str(),
                    agent_id.as_str(),
                    visitor_id.as_str(),
                    direction.as_str(),
                    message.kind.to_string(),
                    message.content,
                    message.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// History between two identities, both directions, insertion order.
    #[instrument(skip(self))]
    pub fn history(&self, a: &Identity, b: &Identity) -> Result<Vec<ChatMessage>, StoreError> {
        // Either side may be the agent; derive the canonical pair.
        let (agent_id, visitor_id) = match (a, b) {
            (Identity::Agent { id }, Identity::Visitor { id: vis, .. })
            | (Identity::Visitor { id: vis, .. }, Identity::Agent { id }) => {
                (id.clone(), vis.clone())
            }
            _ => {
                return Err(StoreError::Conflict(
                    "history is only defined between an agent and a visitor".into(),
                ))
            }
        };

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, visitor_id, direction, kind, content, created_at
                 FROM messages WHERE agent_id = ?1 AND visitor_id = ?2
                 ORDER BY created_at, id",
            )?;
            let mut rows = stmt.query([agent_id.as_str(), visitor_id.as_str()])?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            Ok(out)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    let id: String = row.get(0)?;
    let agent_id: String = row.get(1)?;
    let visitor_id: String = row.get(2)?;
    let direction: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let content: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    let agent = Identity::agent(AgentId::from_raw(agent_id.clone()));
    let visitor = Identity::visitor(VisitorId::from_raw(visitor_id), AgentId::from_raw(agent_id));

    let (sender, recipient) = match Direction::parse(&direction)? {
        Direction::ToAgent => (visitor, agent),
        Direction::ToVisitor => (agent, visitor),
    };

    Ok(ChatMessage {
        id: MessageId::from_raw(id),
        sender,
        recipient,
        kind: kind
            .parse::<MessageKind>()
            .map_err(StoreError::Database)?,
        content,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| StoreError::Database(format!("created_at: {e}")))?,
    })
}

/// `MessageStore` implementation over the SQLite repo.
pub struct SqliteMessageStore {
    repo: MessageRepo,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: MessageRepo::new(db),
        }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), RelayError> {
        self.repo.append(message)?;
        Ok(())
    }

    async fn query_history(
        &self,
        a: &Identity,
        b: &Identity,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        Ok(self.repo.history(a, b)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Identity, Identity) {
        let agent_id = AgentId::new();
        let agent = Identity::agent(agent_id.clone());
        let visitor = Identity::visitor(VisitorId::new(), agent_id);
        (agent, visitor)
    }

    fn msg(sender: &Identity, recipient: &Identity, content: &str) -> ChatMessage {
        ChatMessage::new(
            MessageId::new(),
            sender.clone(),
            recipient.clone(),
            MessageKind::Text,
            content,
        )
    }

    #[test]
    fn append_and_history_roundtrip() {
        let db = Database::in_memory().unwrap();
        let repo = MessageRepo::new(db);
        let (agent, visitor) = pair();

        repo.append(&msg(&visitor, &agent, "hi")).unwrap();
        repo.append(&msg(&agent, &visitor, "hello, how can I help?")).unwrap();

        let history = repo.history(&agent, &visitor).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[0].sender, visitor);
        assert_eq!(history[1].sender, agent);

        // Order of arguments doesn't matter
        let same = repo.history(&visitor, &agent).unwrap();
        assert_eq!(same.len(), 2);
    }

    #[test]
    fn append_is_idempotent_on_id() {
        let db = Database::in_memory().unwrap();
        let repo = MessageRepo::new(db);
        let (agent, visitor) = pair();

        let m = msg(&visitor, &agent, "hi");
        repo.append(&m).unwrap();
        repo.append(&m).unwrap();

        let history = repo.history(&agent, &visitor).unwrap();
        assert_eq!(history.len(), 1, "re-sent message must not duplicate");
    }

    #[test]
    fn history_is_scoped_to_the_pair() {
        let db = Database::in_memory().unwrap();
        let repo = MessageRepo::new(db);
        let (agent, visitor) = pair();
        let (other_agent, other_visitor) = pair();

        repo.append(&msg(&visitor, &agent, "for you")).unwrap();
        repo.append(&msg(&other_visitor, &other_agent, "not for you")).unwrap();

        let history = repo.history(&agent, &visitor).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "for you");
    }

    #[test]
    fn cross_pair_message_rejected() {
        let db = Database::in_memory().unwrap();
        let repo = MessageRepo::new(db);
        let (agent, _) = pair();
        let (_, foreign_visitor) = pair();

        // Visitor linked to a different agent
        let res = repo.append(&msg(&foreign_visitor, &agent, "hi"));
        assert!(matches!(res, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn agent_to_agent_history_rejected() {
        let db = Database::in_memory().unwrap();
        let repo = MessageRepo::new(db);
        let a = Identity::agent(AgentId::new());
        let b = Identity::agent(AgentId::new());
        assert!(repo.history(&a, &b).is_err());
    }

    #[tokio::test]
    async fn message_store_trait_impl() {
        let db = Database::in_memory().unwrap();
        let store = SqliteMessageStore::new(db);
        let (agent, visitor) = pair();

        let m = msg(&visitor, &agent, "via trait");
        store.append(&m).await.unwrap();

        let history = store.query_history(&agent, &visitor).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, m.id);
    }
}
