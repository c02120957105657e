//! Core types for the parley chat relay: identities, wire protocol,
//! message model, error taxonomy, and the traits the relay consumes
//! from its collaborators (credential validation, link resolution,
//! message persistence).

pub mod errors;
pub mod identity;
pub mod ids;
pub mod message;
pub mod traits;
pub mod wire;
