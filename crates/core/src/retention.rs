#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Keep every version.
pub const UNBOUNDED: i64 = -1;
/// Floor used when neither `maxVersionCount` nor `versionsToKeep` is set.
pub const DEFAULT_MAX_VERSION_COUNT: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySettings {
    #[serde(default = "default_enable_history")]
    pub enable_history: bool,
    /// `-1` keeps everything, `0` or unset falls back to the floor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions_to_keep: Option<u32>,
}

fn default_enable_history() -> bool {
    true
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            enable_history: true,
            max_version_count: None,
            versions_to_keep: None,
        }
    }
}

/// How many states the history table keeps per feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionBound {
    Disabled,
    Unbounded,
    KeepLatest(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetentionError {
    NegativeCount(i64),
    CountTooLarge(i64),
}

impl RetentionError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NegativeCount(_) => "maxVersionCount must be -1 or a non-negative number",
            Self::CountTooLarge(_) => "maxVersionCount is too large",
        }
    }
}

impl std::fmt::Display for RetentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeCount(v) | Self::CountTooLarge(v) => {
                write!(f, "{} (got {v})", self.message())
            }
        }
    }
}

impl std::error::Error for RetentionError {}

impl HistorySettings {
    pub fn disabled() -> Self {
        Self {
            enable_history: false,
            ..Self::default()
        }
    }

    pub fn keep_latest(count: u32) -> Self {
        Self {
            max_version_count: Some(i64::from(count)),
            ..Self::default()
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_version_count: Some(UNBOUNDED),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), RetentionError> {
        match self.max_version_count {
            Some(v) if v < UNBOUNDED => Err(RetentionError::NegativeCount(v)),
            Some(v) if v > i64::from(u32::MAX) => Err(RetentionError::CountTooLarge(v)),
            _ => Ok(()),
        }
    }

    /// `default_floor` applies when neither a count nor a positive `versionsToKeep` is set.
    pub fn bound(&self, default_floor: u32) -> RetentionBound {
        if !self.enable_history {
            return RetentionBound::Disabled;
        }
        match self.max_version_count {
            Some(UNBOUNDED) => RetentionBound::Unbounded,
            Some(v) if v > 0 => RetentionBound::KeepLatest(u32::try_from(v).unwrap_or(u32::MAX)),
            _ => RetentionBound::KeepLatest(
                self.versions_to_keep
                    .filter(|&keep| keep > 0)
                    .unwrap_or(default_floor),
            ),
        }
    }
}

impl RetentionBound {
    pub fn keep(self) -> Option<u32> {
        match self {
            Self::KeepLatest(k) => Some(k),
            Self::Disabled | Self::Unbounded => None,
        }
    }

    /// True when moving from `self` to `next` can leave rows beyond the new bound.
    pub fn is_tightened_by(self, next: Self) -> bool {
        match (self, next) {
            (_, Self::Disabled) | (_, Self::Unbounded) => false,
            (Self::Unbounded | Self::Disabled, Self::KeepLatest(_)) => true,
            (Self::KeepLatest(old), Self::KeepLatest(new)) => new < old,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_resolution() {
        assert_eq!(
            HistorySettings::default().bound(DEFAULT_MAX_VERSION_COUNT),
            RetentionBound::KeepLatest(10)
        );
        assert_eq!(HistorySettings::unbounded().bound(10), RetentionBound::Unbounded);
        assert_eq!(HistorySettings::keep_latest(3).bound(10), RetentionBound::KeepLatest(3));
        assert_eq!(HistorySettings::disabled().bound(10), RetentionBound::Disabled);

        let zero_with_floor = HistorySettings {
            max_version_count: Some(0),
            versions_to_keep: Some(4),
            ..HistorySettings::default()
        };
        assert_eq!(zero_with_floor.bound(10), RetentionBound::KeepLatest(4));
    }

    #[test]
    fn zero_counts_fall_back_to_the_default_floor() {
        let zeros = HistorySettings {
            max_version_count: Some(0),
            versions_to_keep: Some(0),
            ..HistorySettings::default()
        };
        assert_eq!(zeros.bound(10), RetentionBound::KeepLatest(10));

        let zero_keep_only = HistorySettings {
            max_version_count: None,
            versions_to_keep: Some(0),
            ..HistorySettings::default()
        };
        assert_eq!(zero_keep_only.bound(7), RetentionBound::KeepLatest(7));
    }

    #[test]
    fn only_lowering_the_bound_counts_as_tightening() {
        let three = RetentionBound::KeepLatest(3);
        let five = RetentionBound::KeepLatest(5);
        assert!(five.is_tightened_by(three));
        assert!(!three.is_tightened_by(five));
        assert!(!three.is_tightened_by(RetentionBound::Unbounded));
        assert!(RetentionBound::Unbounded.is_tightened_by(three));
    }

    #[test]
    fn counts_below_minus_one_are_rejected() {
        let bad = HistorySettings {
            max_version_count: Some(-2),
            ..HistorySettings::default()
        };
        assert_eq!(bad.validate(), Err(RetentionError::NegativeCount(-2)));
        assert!(HistorySettings::unbounded().validate().is_ok());
    }

    #[test]
    fn json_field_names() {
        let parsed: HistorySettings =
            serde_json::from_str(r#"{"maxVersionCount":5,"versionsToKeep":2}"#).unwrap();
        assert!(parsed.enable_history);
        assert_eq!(parsed.max_version_count, Some(5));
        assert_eq!(parsed.versions_to_keep, Some(2));
    }
}
