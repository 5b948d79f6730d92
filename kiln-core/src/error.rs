use thiserror::Error;

/// Everything a generation call can fail with. The HTTP layer maps these onto status codes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// A required field is missing or empty.
    #[error("{0}")]
    Validation(String),

    /// Another generation holds the gate.
    #[error("Generation already in progress")]
    Busy,

    /// The backend failed; carries its message.
    #[error("{0}")]
    Pipeline(String),

    /// A conditioning image could not be decoded.
    #[error("Invalid image data: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, GenerationError>;
