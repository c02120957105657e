use async_trait::async_trait;
use chrono::{DateTime, Utc};

use parley_core::errors::RelayError;
use parley_core::identity::Identity;
use parley_core::traits::LastSeenStore;

use crate::database::Database;
use crate::error::StoreError;

/// Last-seen timestamps written at connection teardown, served back on
/// history loads and offline presence notifications.
pub struct LastSeenRepo {
    db: Database,
}

impl LastSeenRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record(&self, identity_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO last_seen (identity_id, last_seen_at) VALUES (?1, ?2)
                 ON CONFLICT(identity_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
                rusqlite::params![identity_id, at.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, identity_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT last_seen_at FROM last_seen WHERE identity_id = ?1")?;
            let mut rows = stmt.query([identity_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })?;

        match raw {
            Some(s) => Ok(Some(s.parse().map_err(|e| {
                StoreError::Database(format!("last_seen_at: {e}"))
            })?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LastSeenStore for LastSeenRepo {
    async fn record(&self, identity: &Identity, at: DateTime<Utc>) -> Result<(), RelayError> {
        Ok(self.record(identity.id_str(), at)?)
    }
}
