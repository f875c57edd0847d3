/// Crate-wide result type for storage operations.
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The authoritative store rejected a write; the transaction is aborted.
    #[error("primary write failed: {0}")]
    PrimaryWrite(#[source] rusqlite::Error),

    /// COMMIT itself failed (e.g. a deferred constraint); nothing was applied.
    #[error("commit failed: {0}")]
    Commit(#[source] rusqlite::Error),

    /// Another writer already recorded this `(account_id, idempotency_key)`.
    #[error("idempotency key {idempotency_key} already used for account {account_id}")]
    IdempotencyConflict {
        account_id: String,
        idempotency_key: String,
    },

    #[error("account conflicts with an existing account: {0}")]
    DuplicateAccount(String),

    #[error("message {id} rejected: {reason}")]
    InvalidMessage { id: String, reason: String },

    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl DbError {
    pub(crate) fn corrupt(id: &str, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// True when SQLite refused a row because of a UNIQUE or PRIMARY KEY constraint.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}
