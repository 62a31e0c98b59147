#![forbid(unsafe_code)]

//! History retention: superseded states go to `feature_history` inside the
//! mutating transaction and are trimmed to the collection's bound.

use super::collections::find_collection_tx;
use super::exec::{ExecOptions, SqlBatch, SqlQuery};
use super::*;
use rusqlite::Connection;
use sv_core::retention::RetentionBound;

const HISTORY_TABLE: &str = "feature_history";

/// Advisory lock serializing maintenance of one collection's history.
pub(super) fn history_lock_name(collection: &str) -> String {
    format!("{HISTORY_TABLE}:{collection}")
}

/// Appends `states` (oldest first) and trims the feature's history.
///
/// Failures are reported as [`StoreError::Retention`] so the caller's
/// mutation rolls back with it; transient ones stay retryable.
pub(super) fn record_superseded_tx(
    conn: &Connection,
    collection: &str,
    bound: RetentionBound,
    states: &[&StoredState],
) -> Result<(), StoreError> {
    if bound == RetentionBound::Disabled {
        return Ok(());
    }
    let Some(first) = states.first() else {
        return Ok(());
    };
    let (node_id, id) = (first.node_id, first.id.clone());

    let result = states
        .iter()
        .try_for_each(|state| write_state_tx(conn, collection, StateTable::History, state))
        .and_then(|()| match bound.keep() {
            Some(keep) => prune_feature_tx(conn, collection, node_id, &id, keep).map(|_| ()),
            None => Ok(()),
        });

    result.map_err(|err| {
        tracing::error!(
            collection,
            node_id,
            feature = %id,
            "history retention failed: {err}"
        );
        retention_failure(err)
    })
}

fn retention_failure(err: StoreError) -> StoreError {
    if err.is_transient() {
        err
    } else {
        StoreError::Retention(Box::new(err))
    }
}

/// Keeps the `keep` most recent states of one feature on one node.
fn prune_feature_tx(
    conn: &Connection,
    collection: &str,
    node_id: u32,
    id: &str,
    keep: u32,
) -> Result<usize, StoreError> {
    let scope = SqlQuery::new("collection = #{collection} AND node_id = #{node_id} AND id = #{id}")
        .named("collection", collection)
        .named("node_id", node_id)
        .named("id", id);
    SqlQuery::new(
        "DELETE FROM ${history} WHERE ${{scope}} AND version NOT IN (\
           SELECT version FROM ${history} WHERE ${{scope}} \
           ORDER BY updated_at_ms DESC, version DESC LIMIT #{keep})",
    )
    .variable("history", HISTORY_TABLE)
    .fragment("scope", scope)
    .named("keep", keep)
    .execute_on(conn)
}

fn prune_collection_query(collection: &str, keep: u32) -> SqlQuery {
    SqlQuery::new(
        "DELETE FROM ${history} WHERE rowid IN (\
           SELECT rowid FROM (\
             SELECT rowid, ROW_NUMBER() OVER (\
               PARTITION BY node_id, id ORDER BY updated_at_ms DESC, version DESC\
             ) AS position \
             FROM ${history} WHERE collection = #{collection}\
           ) WHERE position > #{keep})",
    )
    .variable("history", HISTORY_TABLE)
    .named("collection", collection)
    .named("keep", keep)
}

/// Re-applies `keep` to every feature of the collection.
pub(super) fn prune_collection_tx(
    conn: &Connection,
    collection: &str,
    keep: u32,
) -> Result<usize, StoreError> {
    prune_collection_query(collection, keep).execute_on(conn)
}

impl FeatureStore {
    /// Maintenance pass trimming every feature's history to the collection's
    /// current bound. Returns the number of removed states.
    pub fn prune_history(&self, collection: &str) -> Result<usize, StoreError> {
        let collection = canonicalize_collection(collection)?;
        let config = self
            .executor
            .snapshot(ExecOptions::new("prune_history"), |tx| {
                find_collection_tx(tx, &collection)
            })?
            .ok_or(StoreError::UnknownCollection)?;

        let Some(keep) = config
            .history
            .bound(self.config.default_max_version_count)
            .keep()
        else {
            return Ok(0);
        };

        let batch = SqlBatch::new()
            .with_lock(history_lock_name(&collection))
            .push(prune_collection_query(&collection, keep));
        let removed: usize = self.executor.write_batch(&batch)?.into_iter().sum();

        tracing::info!(collection = %collection, keep, removed, "history pruned");
        Ok(removed)
    }
}
