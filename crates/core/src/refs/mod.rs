#![forbid(unsafe_code)]

//! Addressing points and ranges in a collection's history.
//!
//! Grammar: `[branch ":"] (version | "HEAD" | "*" | tag | start ".." end)`.
//! The branch defaults to `main` and is elided from the canonical form.

mod error;
mod parse;

pub use error::RefError;
pub use parse::is_valid_tag;

use std::fmt;
use std::str::FromStr;

pub const MAIN_BRANCH: &str = "main";
pub const HEAD: &str = "HEAD";
pub const ALL_VERSIONS: &str = "*";
pub const RANGE_SEPARATOR: &str = "..";

/// One side of a `start..end` range. Both sides share the outer branch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RangeBound {
    Head,
    Version(u64),
    Tag(String),
}

impl RangeBound {
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::Version(v) => Some(*v),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Tag(t) => Some(t.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for RangeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => f.write_str(HEAD),
            Self::Version(v) => write!(f, "{v}"),
            Self::Tag(t) => f.write_str(t),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RefTarget {
    Head,
    AllVersions,
    Version(u64),
    Tag(String),
    Range { start: RangeBound, end: RangeBound },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ref {
    branch: String,
    target: RefTarget,
}

impl Ref {
    pub fn parse(text: &str) -> Result<Self, RefError> {
        parse::parse_ref(text)
    }

    /// `main:HEAD`.
    pub fn head() -> Self {
        Self {
            branch: MAIN_BRANCH.to_string(),
            target: RefTarget::Head,
        }
    }

    pub fn from_branch_id(branch: &str) -> Result<Self, RefError> {
        parse::validate_branch(branch)?;
        Ok(Self {
            branch: branch.to_string(),
            target: RefTarget::Head,
        })
    }

    pub fn from_branch_version(branch: &str, version: u64) -> Result<Self, RefError> {
        parse::validate_branch(branch)?;
        Ok(Self {
            branch: branch.to_string(),
            target: RefTarget::Version(version),
        })
    }

    pub fn from_tag(branch: &str, tag: &str) -> Result<Self, RefError> {
        parse::validate_branch(branch)?;
        if !is_valid_tag(tag) {
            return Err(RefError::InvalidTag);
        }
        Ok(Self {
            branch: branch.to_string(),
            target: RefTarget::Tag(tag.to_string()),
        })
    }

    pub fn range(branch: &str, start: RangeBound, end: RangeBound) -> Result<Self, RefError> {
        parse::validate_branch(branch)?;
        parse::validate_range(&start, &end)?;
        Ok(Self {
            branch: branch.to_string(),
            target: RefTarget::Range { start, end },
        })
    }

    pub(crate) fn from_parts(branch: String, target: RefTarget) -> Self {
        Self { branch, target }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn target(&self) -> &RefTarget {
        &self.target
    }

    pub fn is_main(&self) -> bool {
        self.branch == MAIN_BRANCH
    }

    pub fn is_head(&self) -> bool {
        matches!(self.target, RefTarget::Head)
    }

    pub fn is_all_versions(&self) -> bool {
        matches!(self.target, RefTarget::AllVersions)
    }

    pub fn is_tag(&self) -> bool {
        matches!(self.target, RefTarget::Tag(_))
    }

    pub fn is_range(&self) -> bool {
        matches!(self.target, RefTarget::Range { .. })
    }

    /// True for refs that address exactly one version (HEAD, number or tag).
    pub fn is_single_version(&self) -> bool {
        matches!(
            self.target,
            RefTarget::Head | RefTarget::Version(_) | RefTarget::Tag(_)
        )
    }

    pub fn version(&self) -> Option<u64> {
        match self.target {
            RefTarget::Version(v) => Some(v),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.target {
            RefTarget::Tag(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn range_bounds(&self) -> Option<(&RangeBound, &RangeBound)> {
        match &self.target {
            RefTarget::Range { start, end } => Some((start, end)),
            _ => None,
        }
    }
}

impl Default for Ref {
    fn default() -> Self {
        Self::head()
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_main() {
            write!(f, "{}:", self.branch)?;
        }
        match &self.target {
            RefTarget::Head => f.write_str(HEAD),
            RefTarget::AllVersions => f.write_str(ALL_VERSIONS),
            RefTarget::Version(v) => write!(f, "{v}"),
            RefTarget::Tag(t) => f.write_str(t),
            RefTarget::Range { start, end } => write!(f, "{start}{RANGE_SEPARATOR}{end}"),
        }
    }
}

impl FromStr for Ref {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Ref {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Ref {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
