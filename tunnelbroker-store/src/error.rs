//! Typed errors the Store hands back to callers that need to branch on
//! the failure kind (spec §4.1, §7).

use thiserror::Error;

/// Failure from a Store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row matched (unknown secret, unknown session, unknown record).
    #[error("not found")]
    NotFound,

    /// The token matched but is expired or deactivated.
    #[error("token expired or inactive")]
    Expired,

    /// A caller supplied an input the Store refuses to write, e.g. a
    /// negative byte delta.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The underlying database returned an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed at startup.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
