//! # snare-id
//!
//! Session identifiers for the snare proxy engine.
//!
//! ## Design Principles
//!
//! - One id per accepted connection, generated at accept time
//! - Short enough to read in an interleaved log stream
//! - Canonical string representation with strict parsing
//!
//! ## ID Format
//!
//! A session id is 8 lowercase Crockford base32 characters drawn from the
//! random component of a fresh ULID, e.g. `k3v9x2qd`.

mod error;
mod types;

pub use error::IdError;
pub use types::SessionId;

/// Re-export ulid for consumers that need to derive ids from raw ULIDs
pub use ulid::Ulid;
