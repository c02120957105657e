use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use parley_core::errors::RelayError;
use parley_core::identity::{Identity, Role};
use parley_core::ids::{AgentId, KeyId, LinkCode, VisitorId};
use parley_core::traits::{CredentialValidator, LinkResolver, ShareLink};

use crate::database::Database;
use crate::error::StoreError;

/// A bearer key granting agent access.
#[derive(Clone, Debug)]
pub struct AccessKey {
    pub key: KeyId,
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

pub struct KeyRepo {
    db: Database,
}

impl KeyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a fresh agent key.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn issue(
        &self,
        agent_id: &AgentId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AccessKey, StoreError> {
        let key = KeyId::new();
        let now = Utc::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO access_keys (key, agent_id, created_at, expires_at, revoked)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                rusqlite::params![
                    key.as_str(),
                    agent_id.as_str(),
                    now.to_rfc3339(),
                    expires_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })?;

        Ok(AccessKey {
            key,
            agent_id: agent_id.clone(),
            created_at: now,
            expires_at,
            revoked: false,
        })
    }

    /// Mark a key revoked. Existing connections are not torn down; the
    /// key simply stops validating.
    pub fn revoke(&self, key: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("UPDATE access_keys SET revoked = 1 WHERE key = ?1", [key])?;
            Ok(n > 0)
        })
    }

    /// The agent a key grants access to, if the key is currently valid.
    pub fn validate(&self, key: &str) -> Result<Option<AgentId>, StoreError> {
        let row: Option<(String, Option<String>, bool)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, expires_at, revoked FROM access_keys WHERE key = ?1",
            )?;
            let mut rows = stmt.query([key])?;
            match rows.next()? {
                Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
                None => Ok(None),
            }
        })?;

        let Some((agent_id, expires_at, revoked)) = row else {
            return Ok(None);
        };
        if revoked {
            return Ok(None);
        }
        if let Some(exp) = expires_at {
            let exp: DateTime<Utc> = exp
                .parse()
                .map_err(|e| StoreError::Database(format!("expires_at: {e}")))?;
            if exp <= Utc::now() {
                return Ok(None);
            }
        }
        Ok(Some(AgentId::from_raw(agent_id)))
    }
}

pub struct LinkRepo {
    db: Database,
}

impl LinkRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a share-link code for an agent.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn issue(
        &self,
        agent_id: &AgentId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<LinkCode, StoreError> {
        let code = LinkCode::new();
        let now = Utc::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO share_links (code, agent_id, created_at, expires_at, active)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                rusqlite::params![
                    code.as_str(),
                    agent_id.as_str(),
                    now.to_rfc3339(),
                    expires_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })?;

        Ok(code)
    }

    pub fn deactivate(&self, code: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("UPDATE share_links SET active = 0 WHERE code = ?1", [code])?;
            Ok(n > 0)
        })
    }

    pub fn resolve(&self, code: &str) -> Result<Option<ShareLink>, StoreError> {
        let row: Option<(String, Option<String>, bool)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, expires_at, active FROM share_links WHERE code = ?1",
            )?;
            let mut rows = stmt.query([code])?;
            match rows.next()? {
                Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
                None => Ok(None),
            }
        })?;

        let Some((agent_id, expires_at, active)) = row else {
            return Ok(None);
        };
        let expires_at = match expires_at {
            Some(s) => Some(
                s.parse::<DateTime<Utc>>()
                    .map_err(|e| StoreError::Database(format!("expires_at: {e}")))?,
            ),
            None => None,
        };
        Ok(Some(ShareLink {
            agent_id: AgentId::from_raw(agent_id),
            expires_at,
            active,
        }))
    }
}

/// Credential oracle over the access-key and share-link tables.
///
/// Agents present a bearer key; visitors present a share-link code plus
/// an optional identity hint so a returning visitor keeps its id.
pub struct SqliteCredentialValidator {
    keys: KeyRepo,
    links: LinkRepo,
}

impl SqliteCredentialValidator {
    pub fn new(db: Database) -> Self {
        Self {
            keys: KeyRepo::new(db.clone()),
            links: LinkRepo::new(db),
        }
    }
}

#[async_trait]
impl CredentialValidator for SqliteCredentialValidator {
    async fn validate(
        &self,
        role: Role,
        credential: &str,
        identity_hint: Option<&str>,
    ) -> Result<Identity, RelayError> {
        match role {
            Role::Agent => match self.keys.validate(credential)? {
                Some(agent_id) => Ok(Identity::agent(agent_id)),
                None => Err(RelayError::Auth),
            },
            Role::Visitor => {
                let link = self.links.resolve(credential)?.ok_or(RelayError::Auth)?;
                if !link.is_usable(Utc::now()) {
                    warn!(code = credential, "rejected unusable share link");
                    return Err(RelayError::Auth);
                }
                let visitor_id = match identity_hint {
                    Some(hint) => VisitorId::from_raw(hint),
                    None => VisitorId::new(),
                };
                Ok(Identity::visitor(visitor_id, link.agent_id))
            }
        }
    }
}

#[async_trait]
impl LinkResolver for SqliteCredentialValidator {
    async fn resolve(&self, code: &str) -> Result<Option<ShareLink>, RelayError> {
        Ok(self.links.resolve(code)?)
    }
}
