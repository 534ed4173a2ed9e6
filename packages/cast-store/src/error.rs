// Error types for the dedup storage core
use thiserror::Error;

/// Errors raised by the ledgers, the content store and the engines.
///
/// `QuotaExceeded`, `NotFound` and `Forbidden` are terminal for the request.
/// `StorageUnavailable` and `ConcurrencyConflict` may be retried by the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("quota exceeded for {owner_id}: {charged} + {requested} bytes > limit {limit}")]
    QuotaExceeded {
        owner_id: String,
        requested: u64,
        charged: u64,
        limit: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {caller} does not own entry {entry_id}")]
    Forbidden { caller: String, entry_id: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether the whole operation may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StorageUnavailable(_) | CoreError::ConcurrencyConflict(_)
        )
    }

    pub(crate) fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        CoreError::StorageUnavailable(format!("{}: {}", context, err))
    }
}

// SQLITE_BUSY and SQLITE_LOCKED primary result codes
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => {
                CoreError::ConcurrencyConflict("timed out waiting for a database connection".into())
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code();
                let code = code.as_deref().unwrap_or_default();
                // Extended codes keep the primary code in the low byte.
                let primary = code
                    .parse::<u32>()
                    .map(|c| (c & 0xff).to_string())
                    .unwrap_or_default();
                if primary == SQLITE_BUSY || primary == SQLITE_LOCKED {
                    CoreError::ConcurrencyConflict(db_err.message().to_string())
                } else {
                    CoreError::StorageUnavailable(format!("metadata database: {}", err))
                }
            }
            _ => CoreError::StorageUnavailable(format!("metadata database: {}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(CoreError::StorageUnavailable("disk".into()).is_retryable());
        assert!(CoreError::ConcurrencyConflict("lock".into()).is_retryable());
        assert!(!CoreError::NotFound("x".into()).is_retryable());
        assert!(!CoreError::Forbidden {
            caller: "a".into(),
            entry_id: "b".into()
        }
        .is_retryable());
        assert!(!CoreError::QuotaExceeded {
            owner_id: "a".into(),
            requested: 1,
            charged: 0,
            limit: 0
        }
        .is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_conflict() {
        let err: CoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, CoreError::ConcurrencyConflict(_)));
    }

    #[test]
    fn test_other_sqlx_errors_are_storage() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::StorageUnavailable(_)));
    }

    #[test]
    fn test_quota_message() {
        let err = CoreError::QuotaExceeded {
            owner_id: "u1".into(),
            requested: 200,
            charged: 900,
            limit: 1000,
        };
        assert_eq!(
            err.to_string(),
            "quota exceeded for u1: 900 + 200 bytes > limit 1000"
        );
    }
}
