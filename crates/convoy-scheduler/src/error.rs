//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Db(#[from] convoy_db::DbError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
