#![forbid(unsafe_code)]

use super::branches::{branch_chain_tx, load_branch_tx};
use super::exec::ExecOptions;
use super::refs::{VersionSelection, resolve_ref_tx};
use super::*;
use rusqlite::{Connection, OptionalExtension, params};
use sv_core::feature::Feature;
use sv_core::refs::Ref;

impl FeatureStore {
    /// State of `id` as seen from a single-version ref; deleted or missing
    /// features read as `None`.
    pub fn read_feature(
        &self,
        collection: &str,
        id: &str,
        reference: &Ref,
    ) -> Result<Option<Feature>, StoreError> {
        let collection = canonicalize_collection(collection)?;
        let id = canonicalize_feature_id(id)?;
        self.executor.snapshot(ExecOptions::new("read_feature"), |tx| {
            let resolved = resolve_ref_tx(tx, &collection, reference)?;
            let Some(version) = resolved.version() else {
                return Err(StoreError::InvalidInput("reads need a single-version ref"));
            };
            let branch = load_branch_tx(tx, &collection, &resolved.branch)?;
            let chain = branch_chain_tx(tx, &collection, &branch, version)?;
            visible_state_tx(tx, &collection, &chain, &id)?
                .map(|state| state.to_feature())
                .transpose()
        })
    }

    /// Retained superseded states of `id` on the ref's branch, oldest first.
    /// The current HEAD state is not part of the history.
    pub fn feature_history(
        &self,
        collection: &str,
        id: &str,
        reference: &Ref,
    ) -> Result<Vec<Feature>, StoreError> {
        let collection = canonicalize_collection(collection)?;
        let id = canonicalize_feature_id(id)?;
        self.executor.snapshot(ExecOptions::new("feature_history"), |tx| {
            let resolved = resolve_ref_tx(tx, &collection, reference)?;
            let (start, end) = match resolved.selection {
                VersionSelection::Single(version) => (version, version),
                VersionSelection::Range { start, end } => (start, end),
                VersionSelection::All => (0, u64::MAX),
            };
            let end = i64::try_from(end).unwrap_or(i64::MAX);
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {STATE_COLUMNS} FROM feature_history \
                 WHERE collection=?1 AND node_id=?2 AND id=?3 AND version BETWEEN ?4 AND ?5 \
                 ORDER BY version ASC, deleted ASC"
            ))?;
            let states = stmt
                .query_map(
                    params![collection, resolved.node_id, id, to_sqlite_i64(start)?, end],
                    StoredState::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            states.iter().map(StoredState::to_feature).collect()
        })
    }
}

/// Latest state of `id` at or below each node's version limit, walking from
/// the branch towards `main`. A tombstone ends the walk.
pub(super) fn visible_state_tx(
    conn: &Connection,
    collection: &str,
    chain: &[(u32, u64)],
    id: &str,
) -> Result<Option<StoredState>, StoreError> {
    let sql = format!(
        "SELECT {STATE_COLUMNS} FROM features \
         WHERE collection=?1 AND node_id=?2 AND id=?3 AND version<=?4 \
         UNION ALL \
         SELECT {STATE_COLUMNS} FROM feature_history \
         WHERE collection=?1 AND node_id=?2 AND id=?3 AND version<=?4 \
         ORDER BY version DESC, deleted DESC LIMIT 1"
    );
    for &(node_id, limit) in chain {
        let state = conn
            .prepare_cached(&sql)?
            .query_row(
                params![collection, node_id, id, to_sqlite_i64(limit)?],
                StoredState::from_row,
            )
            .optional()?;
        if let Some(state) = state {
            return Ok((!state.deleted).then_some(state));
        }
    }
    Ok(None)
}
