/// Typed error hierarchy for relay operations. Classifies errors by what
/// they affect: only the current message, or the connection itself.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    // Terminal for the connection attempt
    #[error("invalid or expired credential")]
    Auth,

    // Affects only the current message — connection stays up
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("failed to persist message: {0}")]
    Persistence(String),

    // Network-level failure — triggers teardown
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Whether the session must move toward `Closing` because of this
    /// error. Message-scoped failures are reported to the sender and
    /// leave the session alone.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Auth | Self::Transport(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Auth => "auth_failure",
            Self::Validation(_) => "validation_failure",
            Self::Persistence(_) => "persistence_failure",
            Self::Transport(_) => "transport_failure",
        }
    }
}
