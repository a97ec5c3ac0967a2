//! Error types for the sync engine

use crate::object::ObjectId;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during sync bookkeeping
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer sent an object we never asked for, or sent one twice.
    /// The operation is rejected and the state is left untouched.
    #[error("protocol violation for {id}: {reason}")]
    ProtocolViolation { id: ObjectId, reason: &'static str },

    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt state: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
