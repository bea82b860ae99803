use serde::{Deserialize, Serialize};

/// Errors that cross the bridge as structured outcomes.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KviewError {
    #[error("config: {0}")]
    Config(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not_initialized: {0}")]
    NotInitialized(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type KviewResult<T> = Result<T, KviewError>;

/// Raw API object could not be decoded into a tracked object.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ObjectError {
    #[error("object missing metadata")]
    MissingMetadata,
    #[error("object missing metadata.{0}")]
    MissingField(&'static str),
}
