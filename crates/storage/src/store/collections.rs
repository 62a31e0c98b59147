#![forbid(unsafe_code)]

use super::exec::ExecOptions;
use super::history::{history_lock_name, prune_collection_tx};
use super::*;
use rusqlite::{Connection, OptionalExtension, Row, params};
use sv_core::branch::MAIN_NODE_ID;
use sv_core::collection::CollectionConfig;
use sv_core::refs::MAIN_BRANCH;
use sv_core::retention::{HistorySettings, RetentionBound};

const COLLECTION_COLUMNS: &str =
    "id, enable_history, max_version_count, versions_to_keep, processors, created_at_ms";

impl FeatureStore {
    /// Registers a collection together with its `main` branch.
    pub fn create_collection(
        &self,
        config: CollectionConfig,
    ) -> Result<CollectionConfig, StoreError> {
        let id = canonicalize_collection(&config.id)?;
        config
            .history
            .validate()
            .map_err(|err| StoreError::InvalidInput(err.message()))?;
        self.processors.resolve(&config.processors)?;

        let created = CollectionConfig {
            id,
            created_at_ms: now_ms(),
            ..config
        };
        let processors = serde_json::to_string(&created.processors)?;

        self.executor
            .transaction(ExecOptions::new("create_collection"), |tx| {
                let insert = tx.execute(
                    "INSERT INTO collections(id, enable_history, max_version_count, versions_to_keep, processors, created_at_ms, updated_at_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        created.id,
                        created.history.enable_history,
                        created.history.max_version_count,
                        created.history.versions_to_keep,
                        processors,
                        created.created_at_ms,
                    ],
                );
                if let Err(err) = insert {
                    return Err(map_insert_conflict(err, StoreError::CollectionAlreadyExists));
                }

                tx.execute(
                    "INSERT INTO branches(collection, id, node_id, state, head_version, created_at_ms) \
                     VALUES (?1, ?2, ?3, 'NORMAL', 0, ?4)",
                    params![created.id, MAIN_BRANCH, MAIN_NODE_ID, created.created_at_ms],
                )?;
                Ok(())
            })?;

        tracing::info!(collection = %created.id, "collection created");
        Ok(created)
    }

    pub fn get_collection(&self, id: &str) -> Result<Option<CollectionConfig>, StoreError> {
        let id = canonicalize_collection(id)?;
        self.executor
            .snapshot(ExecOptions::new("get_collection"), |tx| {
                find_collection_tx(tx, &id)
            })
    }

    pub fn list_collections(&self) -> Result<Vec<CollectionConfig>, StoreError> {
        self.executor
            .snapshot(ExecOptions::new("list_collections"), |tx| {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {COLLECTION_COLUMNS} FROM collections ORDER BY id ASC"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(collection_from_row(row)?);
                }
                Ok(out)
            })
    }

    /// Replaces history settings and processors. A tighter retention bound
    /// prunes the whole collection before the call returns.
    pub fn update_collection(
        &self,
        config: CollectionConfig,
    ) -> Result<CollectionConfig, StoreError> {
        let id = canonicalize_collection(&config.id)?;
        config
            .history
            .validate()
            .map_err(|err| StoreError::InvalidInput(err.message()))?;
        self.processors.resolve(&config.processors)?;
        let processors = serde_json::to_string(&config.processors)?;
        let floor = self.config.default_max_version_count;

        let options = ExecOptions::new("update_collection").with_lock(history_lock_name(&id));
        let (updated, pruned) = self.executor.transaction(options, |tx| {
            let previous = load_collection_tx(tx, &id)?;
            tx.execute(
                "UPDATE collections SET enable_history=?2, max_version_count=?3, versions_to_keep=?4, processors=?5, updated_at_ms=?6 \
                 WHERE id=?1",
                params![
                    id,
                    config.history.enable_history,
                    config.history.max_version_count,
                    config.history.versions_to_keep,
                    processors,
                    now_ms(),
                ],
            )?;

            let before = previous.history.bound(floor);
            let after = config.history.bound(floor);
            let pruned = match after {
                RetentionBound::KeepLatest(keep) if before.is_tightened_by(after) => {
                    prune_collection_tx(tx, &id, keep)?
                }
                _ => 0,
            };

            let updated = CollectionConfig {
                id: id.clone(),
                history: config.history.clone(),
                processors: config.processors.clone(),
                created_at_ms: previous.created_at_ms,
            };
            Ok((updated, pruned))
        })?;

        tracing::info!(collection = %id, pruned, "collection updated");
        Ok(updated)
    }

    /// Drops the collection with all branches, tags, features and history.
    pub fn delete_collection(&self, id: &str) -> Result<bool, StoreError> {
        let id = canonicalize_collection(id)?;
        let deleted = self
            .executor
            .transaction(ExecOptions::new("delete_collection"), |tx| {
                Ok(tx.execute("DELETE FROM collections WHERE id=?1", params![id])?)
            })?;
        if deleted > 0 {
            tracing::info!(collection = %id, "collection deleted");
        }
        Ok(deleted > 0)
    }
}

pub(super) fn find_collection_tx(
    conn: &Connection,
    id: &str,
) -> Result<Option<CollectionConfig>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {COLLECTION_COLUMNS} FROM collections WHERE id=?1"),
            params![id],
            |row| Ok(collection_from_row(row)),
        )
        .optional()?;
    row.transpose()
}

pub(super) fn load_collection_tx(
    conn: &Connection,
    id: &str,
) -> Result<CollectionConfig, StoreError> {
    find_collection_tx(conn, id)?.ok_or(StoreError::UnknownCollection)
}

fn collection_from_row(row: &Row<'_>) -> Result<CollectionConfig, StoreError> {
    let versions_to_keep = row
        .get::<_, Option<i64>>(3)?
        .map(|value| u32_column(3, value))
        .transpose()?;
    let processors: String = row.get(4)?;
    Ok(CollectionConfig {
        id: row.get(0)?,
        history: HistorySettings {
            enable_history: row.get::<_, i64>(1)? != 0,
            max_version_count: row.get(2)?,
            versions_to_keep,
        },
        processors: serde_json::from_str(&processors)?,
        created_at_ms: row.get(5)?,
    })
}
