#![forbid(unsafe_code)]

use rusqlite::ErrorCode;
use sv_core::refs::RefError;

pub const SQL_STATE_QUERY_CANCELED: &str = "57014";
pub const SQL_STATE_ADMIN_SHUTDOWN: &str = "57P01";
pub const SQL_STATE_CONNECTION_DOES_NOT_EXIST: &str = "08003";
pub const SQL_STATE_CONNECTION_FAILURE: &str = "08006";
pub const SQL_STATE_TOO_MANY_ATTEMPTS: &str = "XYZ51";
pub const SQL_STATE_NO_TIME_LEFT: &str = "54000";

/// Why the execution substrate gave up on a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptFailure {
    TooManyAttempts,
    NoTimeLeft,
}

impl AttemptFailure {
    pub fn sql_state(self) -> &'static str {
        match self {
            Self::TooManyAttempts => SQL_STATE_TOO_MANY_ATTEMPTS,
            Self::NoTimeLeft => SQL_STATE_NO_TIME_LEFT,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::TooManyAttempts => "Too many execution attempts.",
            Self::NoTimeLeft => "No time left to execute query.",
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    Json(serde_json::Error),
    InvalidInput(&'static str),
    InvalidRef(RefError),
    InvalidStatement(String),
    UnknownCollection,
    UnknownBranch,
    UnknownTag,
    UnknownProcessor(String),
    CollectionAlreadyExists,
    BranchAlreadyExists,
    TagAlreadyExists,
    SystemTagProtected,
    BranchNotEmpty,
    PoolTimeout,
    LockTimeout {
        key: i64,
    },
    FailedAttempt {
        reason: AttemptFailure,
        attempts: u32,
        last: Option<Box<StoreError>>,
    },
    Cancelled {
        query_id: String,
    },
    Retention(Box<StoreError>),
}

impl StoreError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Sql(_) => "SQL",
            Self::Json(_) => "JSON",
            Self::InvalidInput(message) if message.starts_with("RESET_REQUIRED") => {
                "RESET_REQUIRED"
            }
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidRef(_) => "INVALID_REF",
            Self::InvalidStatement(_) => "INVALID_STATEMENT",
            Self::UnknownCollection => "UNKNOWN_COLLECTION",
            Self::UnknownBranch => "UNKNOWN_BRANCH",
            Self::UnknownTag => "UNKNOWN_TAG",
            Self::UnknownProcessor(_) => "UNKNOWN_PROCESSOR",
            Self::CollectionAlreadyExists => "COLLECTION_ALREADY_EXISTS",
            Self::BranchAlreadyExists => "BRANCH_ALREADY_EXISTS",
            Self::TagAlreadyExists => "TAG_ALREADY_EXISTS",
            Self::SystemTagProtected => "SYSTEM_TAG_PROTECTED",
            Self::BranchNotEmpty => "BRANCH_NOT_EMPTY",
            Self::PoolTimeout => "POOL_TIMEOUT",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::FailedAttempt { .. } => "FAILED_ATTEMPT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Retention(_) => "RETENTION",
        }
    }

    /// PostgreSQL-style SQL state for backend and substrate failures.
    pub fn sql_state(&self) -> Option<&'static str> {
        match self {
            Self::Sql(rusqlite::Error::SqliteFailure(err, _)) => match err.code {
                ErrorCode::OperationInterrupted => Some(SQL_STATE_QUERY_CANCELED),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Some(SQL_STATE_ADMIN_SHUTDOWN)
                }
                ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => {
                    Some(SQL_STATE_CONNECTION_FAILURE)
                }
                _ => None,
            },
            Self::PoolTimeout => Some(SQL_STATE_CONNECTION_DOES_NOT_EXIST),
            Self::Cancelled { .. } => Some(SQL_STATE_QUERY_CANCELED),
            Self::FailedAttempt { reason, .. } => Some(reason.sql_state()),
            Self::Retention(inner) => inner.sql_state(),
            _ => None,
        }
    }

    /// Worth another attempt while budget and attempts remain.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cancelled { .. } | Self::FailedAttempt { .. } | Self::Retention(_) => false,
            other => matches!(
                other.sql_state(),
                Some(
                    SQL_STATE_QUERY_CANCELED
                        | SQL_STATE_ADMIN_SHUTDOWN
                        | SQL_STATE_CONNECTION_DOES_NOT_EXIST
                        | SQL_STATE_CONNECTION_FAILURE
                )
            ),
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::FailedAttempt { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::Json(err) => write!(f, "json: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::InvalidRef(err) => write!(f, "{err}"),
            Self::InvalidStatement(message) => write!(f, "invalid statement: {message}"),
            Self::UnknownCollection => write!(f, "unknown collection"),
            Self::UnknownBranch => write!(f, "unknown branch"),
            Self::UnknownTag => write!(f, "unknown tag"),
            Self::UnknownProcessor(id) => write!(f, "unknown processor: {id}"),
            Self::CollectionAlreadyExists => write!(f, "collection already exists"),
            Self::BranchAlreadyExists => write!(f, "branch already exists"),
            Self::TagAlreadyExists => write!(f, "tag already exists"),
            Self::SystemTagProtected => write!(f, "system tags cannot be deleted"),
            Self::BranchNotEmpty => write!(f, "branch has features or child branches"),
            Self::PoolTimeout => write!(f, "no pooled connection available in time"),
            Self::LockTimeout { key } => write!(f, "advisory lock {key} not acquired in time"),
            Self::FailedAttempt {
                reason,
                attempts,
                last,
            } => {
                write!(
                    f,
                    "{} (sql_state={}, attempts={attempts})",
                    reason.message(),
                    reason.sql_state()
                )?;
                if let Some(last) = last {
                    write!(f, ": {last}")?;
                }
                Ok(())
            }
            Self::Cancelled { query_id } => write!(f, "query {query_id} was cancelled"),
            Self::Retention(err) => write!(f, "history retention failed: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sql(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::InvalidRef(err) => Some(err),
            Self::FailedAttempt { last: Some(err), .. } | Self::Retention(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<RefError> for StoreError {
    fn from(value: RefError) -> Self {
        Self::InvalidRef(value)
    }
}
