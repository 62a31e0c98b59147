#![forbid(unsafe_code)]

use super::branches::load_branch_tx;
use super::collections::load_collection_tx;
use super::exec::ExecOptions;
use super::refs::resolve_ref_tx;
use super::*;
use rusqlite::{Connection, OptionalExtension, Row, params};
use sv_core::branch::Tag;
use sv_core::refs::is_valid_tag;

const TAG_COLUMNS: &str = "id, collection, version, branch, system, created_at_ms";

impl FeatureStore {
    /// Pins `tag_id` to the version `target` resolves to right now.
    pub fn create_tag(&self, request: CreateTagRequest) -> Result<Tag, StoreError> {
        let collection = canonicalize_collection(&request.collection)?;
        if !is_valid_tag(&request.tag_id) {
            return Err(StoreError::InvalidInput("invalid tag id"));
        }
        if !request.target.is_single_version() {
            return Err(StoreError::InvalidInput("a tag must address a single version"));
        }

        let tag = self
            .executor
            .transaction(ExecOptions::new("create_tag"), |tx| {
                load_collection_tx(tx, &collection)?;
                let target = resolve_ref_tx(tx, &collection, &request.target)?;
                let Some(version) = target.version() else {
                    return Err(StoreError::InvalidInput("a tag must address a single version"));
                };
                let branch = load_branch_tx(tx, &collection, &target.branch)?;
                if version > branch.head_version {
                    return Err(StoreError::InvalidInput(
                        "tag version is ahead of the branch head",
                    ));
                }

                let tag = Tag {
                    id: request.tag_id.clone(),
                    space_id: collection.clone(),
                    version,
                    branch: branch.id,
                    system: request.system,
                    created_at_ms: now_ms(),
                };
                let insert = tx.execute(
                    "INSERT INTO tags(collection, id, branch, version, system, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        tag.space_id,
                        tag.id,
                        tag.branch,
                        to_sqlite_i64(tag.version)?,
                        tag.system,
                        tag.created_at_ms,
                    ],
                );
                if let Err(err) = insert {
                    return Err(map_insert_conflict(err, StoreError::TagAlreadyExists));
                }
                Ok(tag)
            })?;

        tracing::info!(
            collection = %collection,
            tag = %tag.id,
            branch = %tag.branch,
            version = tag.version,
            system = tag.system,
            "tag created"
        );
        Ok(tag)
    }

    pub fn get_tag(&self, collection: &str, tag_id: &str) -> Result<Option<Tag>, StoreError> {
        let collection = canonicalize_collection(collection)?;
        self.executor.snapshot(ExecOptions::new("get_tag"), |tx| {
            load_collection_tx(tx, &collection)?;
            find_tag_tx(tx, &collection, tag_id)
        })
    }

    pub fn list_tags(&self, collection: &str) -> Result<Vec<Tag>, StoreError> {
        let collection = canonicalize_collection(collection)?;
        self.executor.snapshot(ExecOptions::new("list_tags"), |tx| {
            load_collection_tx(tx, &collection)?;
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {TAG_COLUMNS} FROM tags WHERE collection=?1 ORDER BY id ASC"
            ))?;
            let mut rows = stmt.query(params![collection])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(tag_from_row(row)?);
            }
            Ok(out)
        })
    }

    /// Tags are immutable; deleting is the only change, and system tags refuse it.
    pub fn delete_tag(&self, request: DeleteTagRequest) -> Result<(), StoreError> {
        let collection = canonicalize_collection(&request.collection)?;
        self.executor
            .transaction(ExecOptions::new("delete_tag"), |tx| {
                load_collection_tx(tx, &collection)?;
                let tag = find_tag_tx(tx, &collection, &request.tag_id)?
                    .ok_or(StoreError::UnknownTag)?;
                if tag.system {
                    return Err(StoreError::SystemTagProtected);
                }
                tx.execute(
                    "DELETE FROM tags WHERE collection=?1 AND id=?2",
                    params![collection, tag.id],
                )?;
                Ok(())
            })?;
        tracing::info!(collection = %collection, tag = %request.tag_id, "tag deleted");
        Ok(())
    }
}

pub(super) fn find_tag_tx(
    conn: &Connection,
    collection: &str,
    tag_id: &str,
) -> Result<Option<Tag>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TAG_COLUMNS} FROM tags WHERE collection=?1 AND id=?2"),
            params![collection, tag_id],
            |row| Ok(tag_from_row(row)),
        )
        .optional()?;
    row.transpose()
}

fn tag_from_row(row: &Row<'_>) -> Result<Tag, StoreError> {
    Ok(Tag {
        id: row.get(0)?,
        space_id: row.get(1)?,
        version: u64_column(2, row.get(2)?)?,
        branch: row.get(3)?,
        system: row.get::<_, i64>(4)? != 0,
        created_at_ms: row.get(5)?,
    })
}
