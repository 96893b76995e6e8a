//! Error types for session id parsing.

use thiserror::Error;

/// Errors that can occur when parsing a session id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty.
    #[error("session id cannot be empty")]
    Empty,

    /// The id has the wrong number of characters.
    #[error("session id must be {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The id contains a character outside the Crockford base32 alphabet.
    #[error("invalid character {character:?} in session id at position {position}")]
    InvalidCharacter { character: char, position: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
