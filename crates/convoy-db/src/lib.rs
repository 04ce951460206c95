//! Persistence layer for the Convoy CI orchestrator.
//!
//! Provides store traits, PostgreSQL implementations and an in-memory
//! implementation. The in-memory store serializes every operation behind a
//! single lock, which makes the claim operation a compare-and-swap and the
//! store suitable both for single-process deployments and as the test
//! harness.

pub mod error;
pub mod mem;
pub mod store;

pub use error::{DbError, DbResult};
pub use mem::MemStore;
pub use store::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
