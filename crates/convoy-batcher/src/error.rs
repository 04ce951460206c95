//! Batcher error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("store error: {0}")]
    Db(#[from] convoy_db::DbError),
}

pub type BatcherResult<T> = std::result::Result<T, BatcherError>;
