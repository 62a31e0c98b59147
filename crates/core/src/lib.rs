#![forbid(unsafe_code)]

pub mod branch;
pub mod collection;
pub mod feature;
pub mod geometry;
pub mod modify;
pub mod refs;
pub mod retention;

pub mod ids {
    use crate::refs::{ALL_VERSIONS, HEAD};

    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct CollectionId(String);

    impl CollectionId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
            let value = value.into();
            validate_collection_id(&value)?;
            Ok(Self(value))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BranchId(String);

    impl BranchId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
            let value = value.into();
            validate_branch_id(&value)?;
            Ok(Self(value))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum IdError {
        Empty,
        TooLong,
        InvalidFirstChar,
        InvalidChar { ch: char, index: usize },
        Numeric,
        Reserved,
        ContainsControl,
    }

    impl IdError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "id must not be empty",
                Self::TooLong => "id is too long",
                Self::InvalidFirstChar => "id starts with an invalid character",
                Self::InvalidChar { .. } => "id contains an invalid character",
                Self::Numeric => "branch id must not be a number",
                Self::Reserved => "id is reserved",
                Self::ContainsControl => "id contains control characters",
            }
        }
    }

    impl std::fmt::Display for IdError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::InvalidChar { ch, index } => {
                    write!(f, "{} ({ch:?} at {index})", self.message())
                }
                other => f.write_str(other.message()),
            }
        }
    }

    impl std::error::Error for IdError {}

    pub fn validate_collection_id(value: &str) -> Result<(), IdError> {
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > 128 {
            return Err(IdError::TooLong);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(IdError::Empty);
        };
        if !first.is_ascii_alphanumeric() {
            return Err(IdError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate().skip(1) {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                continue;
            }
            return Err(IdError::InvalidChar { ch, index });
        }
        Ok(())
    }

    /// Branch ids share the ref grammar: they must never be mistaken for a
    /// version number and never collide with `HEAD` or `*`.
    pub fn validate_branch_id(value: &str) -> Result<(), IdError> {
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > 64 {
            return Err(IdError::TooLong);
        }
        if value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdError::Numeric);
        }
        if value == HEAD || value == ALL_VERSIONS {
            return Err(IdError::Reserved);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(IdError::Empty);
        };
        if !(first.is_ascii_alphanumeric() || first == '~') {
            return Err(IdError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate().skip(1) {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '~') {
                continue;
            }
            return Err(IdError::InvalidChar { ch, index });
        }
        Ok(())
    }

    pub fn validate_feature_id(value: &str) -> Result<(), IdError> {
        if value.trim().is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > 512 {
            return Err(IdError::TooLong);
        }
        if value.chars().any(|c| c.is_control()) {
            return Err(IdError::ContainsControl);
        }
        Ok(())
    }

}
