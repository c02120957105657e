use parley_core::errors::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

// Store failures surface to connected clients as message-scoped
// persistence errors, never as connection teardown.
impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Persistence(e.to_string())
    }
}
