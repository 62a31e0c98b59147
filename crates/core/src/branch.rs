#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::refs::Ref;

/// Node id of the `main` branch in every collection.
pub const MAIN_NODE_ID: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    Normal,
    InConflict,
}

impl BranchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::InConflict => "IN_CONFLICT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "NORMAL" => Some(Self::Normal),
            "IN_CONFLICT" => Some(Self::InConflict),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    /// Resolved numeric ref the branch was forked from; `None` for `main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<Ref>,
    pub node_id: u32,
    pub state: BranchState,
    /// Merged-in version on this branch, mapped to the source ref.
    #[serde(default)]
    pub merges: BTreeMap<u64, Ref>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_solving_branch: Option<String>,
    pub head_version: u64,
    pub created_at_ms: i64,
}

impl Branch {
    pub fn is_main(&self) -> bool {
        self.node_id == MAIN_NODE_ID
    }

    /// Version of the parent branch this branch sees as its starting state.
    pub fn base_version(&self) -> Option<u64> {
        self.base_ref.as_ref().and_then(Ref::version)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub space_id: String,
    pub version: u64,
    pub branch: String,
    #[serde(default)]
    pub system: bool,
    pub created_at_ms: i64,
}

impl Tag {
    pub fn to_ref(&self) -> Option<Ref> {
        Ref::from_branch_version(&self.branch, self.version).ok()
    }
}
