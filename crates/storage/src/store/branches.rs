#![forbid(unsafe_code)]

use super::collections::load_collection_tx;
use super::exec::ExecOptions;
use super::refs::resolve_ref_tx;
use super::*;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeMap;
use sv_core::branch::{Branch, BranchState};
use sv_core::refs::{MAIN_BRANCH, Ref};

const MAX_BRANCH_DEPTH: usize = 128;

const BRANCH_COLUMNS: &str = "id, node_id, base_branch, base_version, state, conflict_solving_branch, head_version, created_at_ms";

impl FeatureStore {
    /// Forks `branch_id` off a single version of an existing branch.
    pub fn create_branch(&self, request: CreateBranchRequest) -> Result<Branch, StoreError> {
        let collection = canonicalize_collection(&request.collection)?;
        let branch_id = canonicalize_branch(&request.branch_id)?;
        if !request.base.is_single_version() {
            return Err(StoreError::InvalidInput(
                "branch base must address a single version",
            ));
        }

        let branch = self
            .executor
            .transaction(ExecOptions::new("create_branch"), |tx| {
                load_collection_tx(tx, &collection)?;
                let base = resolve_ref_tx(tx, &collection, &request.base)?;
                let Some(base_version) = base.version() else {
                    return Err(StoreError::InvalidInput(
                        "branch base must address a single version",
                    ));
                };
                let parent = load_branch_tx(tx, &collection, &base.branch)?;
                if base_version > parent.head_version {
                    return Err(StoreError::InvalidInput(
                        "branch base version is ahead of the parent head",
                    ));
                }
                if branch_depth_tx(tx, &collection, &parent)? + 1 > MAX_BRANCH_DEPTH {
                    return Err(StoreError::InvalidInput("branch nesting is too deep"));
                }

                let node_id = tx.query_row(
                    "SELECT COALESCE(MAX(node_id), 0) + 1 FROM branches WHERE collection=?1",
                    params![collection],
                    |row| u32_column(0, row.get(0)?),
                )?;
                let branch = Branch {
                    id: branch_id.clone(),
                    base_ref: Some(Ref::from_branch_version(&parent.id, base_version)?),
                    node_id,
                    state: BranchState::Normal,
                    merges: BTreeMap::new(),
                    conflict_solving_branch: None,
                    head_version: base_version,
                    created_at_ms: now_ms(),
                };

                let insert = tx.execute(
                    "INSERT INTO branches(collection, id, node_id, base_branch, base_node_id, base_version, state, head_version, created_at_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        collection,
                        branch.id,
                        branch.node_id,
                        parent.id,
                        parent.node_id,
                        to_sqlite_i64(base_version)?,
                        branch.state.as_str(),
                        to_sqlite_i64(branch.head_version)?,
                        branch.created_at_ms,
                    ],
                );
                if let Err(err) = insert {
                    return Err(map_insert_conflict(err, StoreError::BranchAlreadyExists));
                }
                Ok(branch)
            })?;

        tracing::info!(
            collection = %collection,
            branch = %branch.id,
            node_id = branch.node_id,
            base_version = branch.head_version,
            "branch created"
        );
        Ok(branch)
    }

    pub fn get_branch(&self, collection: &str, branch_id: &str) -> Result<Option<Branch>, StoreError> {
        let collection = canonicalize_collection(collection)?;
        let branch_id = canonicalize_branch(branch_id)?;
        self.executor.snapshot(ExecOptions::new("get_branch"), |tx| {
            load_collection_tx(tx, &collection)?;
            match find_branch_tx(tx, &collection, &branch_id)? {
                Some(branch) => Ok(Some(with_merges_tx(tx, &collection, branch)?)),
                None => Ok(None),
            }
        })
    }

    pub fn list_branches(&self, collection: &str) -> Result<Vec<Branch>, StoreError> {
        let collection = canonicalize_collection(collection)?;
        self.executor.snapshot(ExecOptions::new("list_branches"), |tx| {
            load_collection_tx(tx, &collection)?;
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {BRANCH_COLUMNS} FROM branches WHERE collection=?1 ORDER BY node_id ASC"
            ))?;
            let mut rows = stmt.query(params![collection])?;
            let mut branches = Vec::new();
            while let Some(row) = rows.next()? {
                branches.push(branch_from_row(row)?);
            }
            branches
                .into_iter()
                .map(|branch| with_merges_tx(tx, &collection, branch))
                .collect()
        })
    }

    /// Removes an empty leaf branch and the tags pointing into it.
    pub fn delete_branch(&self, request: DeleteBranchRequest) -> Result<(), StoreError> {
        let collection = canonicalize_collection(&request.collection)?;
        let branch_id = canonicalize_branch(&request.branch_id)?;
        if branch_id == MAIN_BRANCH {
            return Err(StoreError::InvalidInput("the main branch cannot be deleted"));
        }

        self.executor
            .transaction(ExecOptions::new("delete_branch"), |tx| {
                load_collection_tx(tx, &collection)?;
                let branch = load_branch_tx(tx, &collection, &branch_id)?;

                let has_children = tx
                    .query_row(
                        "SELECT 1 FROM branches WHERE collection=?1 AND base_branch=?2 LIMIT 1",
                        params![collection, branch.id],
                        |_row| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                let has_features = tx
                    .query_row(
                        "SELECT 1 FROM features WHERE collection=?1 AND node_id=?2 \
                         UNION ALL \
                         SELECT 1 FROM feature_history WHERE collection=?1 AND node_id=?2 \
                         LIMIT 1",
                        params![collection, branch.node_id],
                        |_row| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                if has_children || has_features {
                    return Err(StoreError::BranchNotEmpty);
                }

                tx.execute(
                    "DELETE FROM tags WHERE collection=?1 AND branch=?2",
                    params![collection, branch.id],
                )?;
                tx.execute(
                    "DELETE FROM branches WHERE collection=?1 AND id=?2",
                    params![collection, branch.id],
                )?;
                Ok(())
            })?;

        tracing::info!(collection = %collection, branch = %branch_id, "branch deleted");
        Ok(())
    }

    /// Flags `branch_id` as conflicting; `solving_branch` carries the resolution.
    pub fn mark_branch_conflict(
        &self,
        collection: &str,
        branch_id: &str,
        solving_branch: &str,
    ) -> Result<Branch, StoreError> {
        let solving_branch = canonicalize_branch(solving_branch)?;
        self.set_branch_state(collection, branch_id, BranchState::InConflict, Some(solving_branch))
    }

    pub fn resolve_branch_conflict(&self, collection: &str, branch_id: &str) -> Result<Branch, StoreError> {
        self.set_branch_state(collection, branch_id, BranchState::Normal, None)
    }

    fn set_branch_state(
        &self,
        collection: &str,
        branch_id: &str,
        state: BranchState,
        solving_branch: Option<String>,
    ) -> Result<Branch, StoreError> {
        let collection = canonicalize_collection(collection)?;
        let branch_id = canonicalize_branch(branch_id)?;
        self.executor
            .transaction(ExecOptions::new("set_branch_state"), |tx| {
                load_collection_tx(tx, &collection)?;
                if let Some(solving) = solving_branch.as_deref() {
                    if solving == branch_id {
                        return Err(StoreError::InvalidInput(
                            "a branch cannot solve its own conflict",
                        ));
                    }
                    load_branch_tx(tx, &collection, solving)?;
                }
                let updated = tx.execute(
                    "UPDATE branches SET state=?3, conflict_solving_branch=?4 WHERE collection=?1 AND id=?2",
                    params![collection, branch_id, state.as_str(), solving_branch],
                )?;
                if updated == 0 {
                    return Err(StoreError::UnknownBranch);
                }
                load_branch_tx(tx, &collection, &branch_id)
            })
    }

    /// Records that `version` on the branch merged in `source`.
    pub fn record_merge(&self, request: RecordMergeRequest) -> Result<Branch, StoreError> {
        let collection = canonicalize_collection(&request.collection)?;
        let branch_id = canonicalize_branch(&request.branch_id)?;
        if !request.source.is_single_version() {
            return Err(StoreError::InvalidInput(
                "merge source must address a single version",
            ));
        }

        self.executor
            .transaction(ExecOptions::new("record_merge"), |tx| {
                load_collection_tx(tx, &collection)?;
                let branch = load_branch_tx(tx, &collection, &branch_id)?;
                if request.version > branch.head_version {
                    return Err(StoreError::InvalidInput(
                        "merge version is ahead of the branch head",
                    ));
                }
                let source = resolve_ref_tx(tx, &collection, &request.source)?;
                let Some(source_version) = source.version() else {
                    return Err(StoreError::InvalidInput(
                        "merge source must address a single version",
                    ));
                };
                if source.branch == branch.id {
                    return Err(StoreError::InvalidInput("a branch cannot merge itself"));
                }
                let source_ref = Ref::from_branch_version(&source.branch, source_version)?;

                let insert = tx.execute(
                    "INSERT INTO branch_merges(collection, branch, version, source_ref) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        collection,
                        branch.id,
                        to_sqlite_i64(request.version)?,
                        source_ref.to_string(),
                    ],
                );
                if let Err(err) = insert {
                    if is_constraint_violation(&err) {
                        return Err(StoreError::InvalidInput(
                            "a merge is already recorded for this version",
                        ));
                    }
                    return Err(err.into());
                }
                with_merges_tx(tx, &collection, branch)
            })
    }
}

pub(super) fn find_branch_tx(
    conn: &Connection,
    collection: &str,
    branch_id: &str,
) -> Result<Option<Branch>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE collection=?1 AND id=?2"),
            params![collection, branch_id],
            |row| Ok(branch_from_row(row)),
        )
        .optional()?;
    row.transpose()
}

/// Branch row without its merge map.
pub(super) fn load_branch_tx(
    conn: &Connection,
    collection: &str,
    branch_id: &str,
) -> Result<Branch, StoreError> {
    find_branch_tx(conn, collection, branch_id)?.ok_or(StoreError::UnknownBranch)
}

fn with_merges_tx(conn: &Connection, collection: &str, mut branch: Branch) -> Result<Branch, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT version, source_ref FROM branch_merges WHERE collection=?1 AND branch=?2 ORDER BY version ASC",
    )?;
    let mut rows = stmt.query(params![collection, branch.id])?;
    while let Some(row) = rows.next()? {
        let version = u64_column(0, row.get(0)?)?;
        let source: String = row.get(1)?;
        branch.merges.insert(version, Ref::parse(&source)?);
    }
    Ok(branch)
}

fn branch_from_row(row: &Row<'_>) -> Result<Branch, StoreError> {
    let id: String = row.get(0)?;
    let base_branch: Option<String> = row.get(2)?;
    let base_version = row
        .get::<_, Option<i64>>(3)?
        .map(|value| u64_column(3, value))
        .transpose()?;
    let base_ref = match (base_branch, base_version) {
        (Some(branch), Some(version)) => Some(Ref::from_branch_version(&branch, version)?),
        _ => None,
    };
    let state: String = row.get(4)?;
    Ok(Branch {
        id,
        base_ref,
        node_id: u32_column(1, row.get(1)?)?,
        state: BranchState::parse(&state)
            .ok_or(StoreError::InvalidInput("invalid branch state row"))?,
        merges: BTreeMap::new(),
        conflict_solving_branch: row.get(5)?,
        head_version: u64_column(6, row.get(6)?)?,
        created_at_ms: row.get(7)?,
    })
}

fn branch_depth_tx(conn: &Connection, collection: &str, branch: &Branch) -> Result<usize, StoreError> {
    Ok(branch_chain_tx(conn, collection, branch, branch.head_version)?.len())
}

/// Nodes whose rows are visible from `branch` at `version`, nearest first,
/// each paired with the highest version readable on that node.
pub(super) fn branch_chain_tx(
    conn: &Connection,
    collection: &str,
    branch: &Branch,
    version: u64,
) -> Result<Vec<(u32, u64)>, StoreError> {
    let mut chain = vec![(branch.node_id, version)];
    let mut limit = version;
    let mut base = branch.base_ref.clone();
    while let Some(base_ref) = base {
        if chain.len() >= MAX_BRANCH_DEPTH {
            return Err(StoreError::InvalidInput("branch nesting is too deep"));
        }
        let parent = load_branch_tx(conn, collection, base_ref.branch())?;
        limit = limit.min(base_ref.version().unwrap_or(0));
        chain.push((parent.node_id, limit));
        base = parent.base_ref;
    }
    Ok(chain)
}
