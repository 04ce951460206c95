//! Error types for Convoy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("version control failure: {0}")]
    Vcs(String),

    #[error("resolution gap: {0}")]
    ResolutionGap(String),

    #[error("host degraded: {0}")]
    HostDegraded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
