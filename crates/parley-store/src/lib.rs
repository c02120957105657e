//! SQLite-backed persistence for the chat relay: message history,
//! access keys, share links, and last-seen records.

pub mod database;
pub mod error;
pub mod keys;
pub mod last_seen;
pub mod messages;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
