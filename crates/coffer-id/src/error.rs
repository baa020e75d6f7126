/// Errors produced by id operations.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid hex character at position {position}: '{character}'")]
    InvalidHex { position: usize, character: char },

    #[error("invalid hex length: expected {expected}, got {actual}")]
    InvalidHexLength { expected: usize, actual: usize },

    #[error("invalid id length: expected {expected} bytes, got {actual}")]
    InvalidIdLength { expected: usize, actual: usize },

    #[error("abbreviation must be 1..=40 hex digits, got {0}")]
    InvalidAbbrevLength(usize),

    #[error("SHA-1 collision detected while hashing")]
    Collision,
}
