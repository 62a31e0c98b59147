#![forbid(unsafe_code)]

use super::branches::load_branch_tx;
use super::collections::load_collection_tx;
use super::exec::ExecOptions;
use super::tags::find_tag_tx;
use super::*;
use rusqlite::Connection;
use sv_core::branch::Branch;
use sv_core::refs::{RangeBound, Ref, RefError, RefTarget};

/// Versions a resolved ref selects on its branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionSelection {
    Single(u64),
    /// Every retained state (`*`).
    All,
    /// Inclusive on both ends.
    Range { start: u64, end: u64 },
}

/// A ref with symbolic parts replaced by stored state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRef {
    pub branch: String,
    pub node_id: u32,
    pub selection: VersionSelection,
}

impl ResolvedRef {
    pub fn version(&self) -> Option<u64> {
        match self.selection {
            VersionSelection::Single(version) => Some(version),
            VersionSelection::All | VersionSelection::Range { .. } => None,
        }
    }

    pub fn contains(&self, version: u64) -> bool {
        match self.selection {
            VersionSelection::Single(v) => v == version,
            VersionSelection::All => true,
            VersionSelection::Range { start, end } => (start..=end).contains(&version),
        }
    }

    /// Numeric form of the ref; `None` for `*`.
    pub fn to_ref(&self) -> Option<Ref> {
        match self.selection {
            VersionSelection::Single(v) => Ref::from_branch_version(&self.branch, v).ok(),
            VersionSelection::Range { start, end } => Ref::range(
                &self.branch,
                RangeBound::Version(start),
                RangeBound::Version(end),
            )
            .ok(),
            VersionSelection::All => None,
        }
    }
}

impl FeatureStore {
    pub fn resolve_ref(&self, collection: &str, reference: &Ref) -> Result<ResolvedRef, StoreError> {
        let collection = canonicalize_collection(collection)?;
        self.executor.snapshot(ExecOptions::new("resolve_ref"), |tx| {
            resolve_ref_tx(tx, &collection, reference)
        })
    }
}

/// Tags resolve onto the branch they were taken on, whatever branch the ref
/// names.
pub(super) fn resolve_ref_tx(
    conn: &Connection,
    collection: &str,
    reference: &Ref,
) -> Result<ResolvedRef, StoreError> {
    load_collection_tx(conn, collection)?;

    let tag = match reference.target() {
        RefTarget::Tag(tag_id) => {
            Some(find_tag_tx(conn, collection, tag_id)?.ok_or(StoreError::UnknownTag)?)
        }
        _ => None,
    };
    let branch_id = tag.as_ref().map_or(reference.branch(), |tag| tag.branch.as_str());
    let branch = load_branch_tx(conn, collection, branch_id)?;

    let selection = match reference.target() {
        RefTarget::Head => VersionSelection::Single(branch.head_version),
        RefTarget::Version(version) => VersionSelection::Single(*version),
        RefTarget::Tag(_) => VersionSelection::Single(tag.map_or(branch.head_version, |tag| tag.version)),
        RefTarget::AllVersions => VersionSelection::All,
        RefTarget::Range { start, end } => {
            let start = resolve_bound_tx(conn, collection, &branch, start)?;
            let end = resolve_bound_tx(conn, collection, &branch, end)?;
            if start > end {
                return Err(RefError::RangeOutOfOrder { start, end }.into());
            }
            VersionSelection::Range { start, end }
        }
    };
    Ok(ResolvedRef {
        branch: branch.id,
        node_id: branch.node_id,
        selection,
    })
}

fn resolve_bound_tx(
    conn: &Connection,
    collection: &str,
    branch: &Branch,
    bound: &RangeBound,
) -> Result<u64, StoreError> {
    match bound {
        RangeBound::Head => Ok(branch.head_version),
        RangeBound::Version(version) => Ok(*version),
        RangeBound::Tag(tag_id) => {
            let tag = find_tag_tx(conn, collection, tag_id)?.ok_or(StoreError::UnknownTag)?;
            if tag.branch != branch.id {
                return Err(StoreError::InvalidInput(
                    "range bounds must be tags on the ranged branch",
                ));
            }
            Ok(tag.version)
        }
    }
}
