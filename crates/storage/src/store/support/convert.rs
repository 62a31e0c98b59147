#![forbid(unsafe_code)]

use rusqlite::ErrorCode;
use sv_core::ids::{BranchId, CollectionId, validate_feature_id};

use super::super::StoreError;

pub(in crate::store) fn to_sqlite_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}

pub(in crate::store) fn u64_column(index: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, value))
}

pub(in crate::store) fn u32_column(index: usize, value: i64) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, value))
}

pub(in crate::store) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}

/// Maps a unique-key violation to `conflict`, everything else to `Sql`.
pub(in crate::store) fn map_insert_conflict(err: rusqlite::Error, conflict: StoreError) -> StoreError {
    if is_constraint_violation(&err) {
        return conflict;
    }
    StoreError::Sql(err)
}

pub(in crate::store) fn canonicalize_collection(value: &str) -> Result<String, StoreError> {
    CollectionId::try_new(value)
        .map(CollectionId::into_string)
        .map_err(|_| StoreError::InvalidInput("invalid collection id"))
}

pub(in crate::store) fn canonicalize_branch(value: &str) -> Result<String, StoreError> {
    BranchId::try_new(value)
        .map(BranchId::into_string)
        .map_err(|_| StoreError::InvalidInput("invalid branch id"))
}

pub(in crate::store) fn canonicalize_feature_id(value: &str) -> Result<String, StoreError> {
    validate_feature_id(value)
        .map(|()| value.to_string())
        .map_err(|_| StoreError::InvalidInput("invalid feature id"))
}
