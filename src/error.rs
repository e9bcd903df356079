use thiserror::Error;

/// Unified error type for the storage engine.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("deadlock detected")]
    Deadlock,

    #[error("lock wait timeout")]
    LockTimeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error in `{field}`: {message}")]
    Config { field: String, message: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no free frames in buffer pool")]
    NoFreeFrames,

    #[error("foreign key cascade too deep")]
    CascadeTooDeep,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Stable numeric kind for API boundaries. `0` is reserved for success.
    pub fn code(&self) -> u32 {
        match self {
            DbError::Corrupted(_) => 1,
            DbError::OutOfRange(_) => 2,
            DbError::ConstraintViolation(_) => 3,
            DbError::Deadlock => 4,
            DbError::LockTimeout => 5,
            DbError::NotFound(_) => 6,
            DbError::AlreadyExists(_) => 7,
            DbError::Io(_) => 8,
            DbError::Serialization(_) => 9,
            DbError::Config { .. } => 10,
            DbError::InvalidOperation(_) => 11,
            DbError::Unsupported(_) => 12,
            DbError::NoFreeFrames => 13,
            DbError::CascadeTooDeep => 14,
            DbError::Internal(_) => 15,
        }
    }

    /// Whether the caller may retry the failed operation on a fresh
    /// transaction. Deadlock victims and lock timeouts roll back the
    /// offending transaction but are not fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Deadlock | DbError::LockTimeout)
    }
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(DbError::Corrupted("x".into()).code(), 1);
        assert_eq!(DbError::OutOfRange("x".into()).code(), 2);
        assert_eq!(DbError::ConstraintViolation("x".into()).code(), 3);
        assert_eq!(DbError::Deadlock.code(), 4);
        assert_eq!(DbError::LockTimeout.code(), 5);
        assert_eq!(DbError::NotFound("x".into()).code(), 6);
        assert_eq!(DbError::AlreadyExists("x".into()).code(), 7);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(DbError::Deadlock.is_retryable());
        assert!(DbError::LockTimeout.is_retryable());
        assert!(!DbError::Corrupted("page 3".into()).is_retryable());
    }
}
