// Error types callers can match on.
//
// Expected scheduling outcomes (capability mismatch, already-terminal task,
// unknown message type) are never errors; they surface as booleans, options
// or status fields. This enum is for input the caller got wrong.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordError {
    /// An identifier string that is not a valid UUID.
    #[error("malformed {kind} id '{value}'")]
    MalformedId { kind: &'static str, value: String },

    /// A config value outside its accepted vocabulary.
    #[error("unknown {field} '{value}' (expected one of: {expected})")]
    UnknownVariant {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    /// A config value that parses but cannot work.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The relay refused the request itself; sending it again cannot help.
    #[error("relay rejected request ({status}): {body}")]
    RelayRejected { status: u16, body: String },
}

/// Parse a UUID-shaped identifier, tagging failures with what it was meant to be.
pub fn parse_id(kind: &'static str, value: &str) -> Result<uuid::Uuid, CoordError> {
    uuid::Uuid::parse_str(value.trim()).map_err(|_| CoordError::MalformedId {
        kind,
        value: value.to_string(),
    })
}
