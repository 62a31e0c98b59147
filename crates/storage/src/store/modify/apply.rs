#![forbid(unsafe_code)]

use super::super::branches::{branch_chain_tx, load_branch_tx};
use super::super::collections::load_collection_tx;
use super::super::history::record_superseded_tx;
use super::super::read::visible_state_tx;
use super::super::*;
use super::{ItemKind, PlannedItem};
use rusqlite::{Connection, params};
use sv_core::feature::{Action, Feature, FeatureMeta};
use sv_core::modify::{
    FailureKind, ModificationFailure, ModifyFeaturesResponse, OnFeatureExists, OnFeatureNotExists,
};
use sv_core::retention::RetentionBound;

pub(super) struct BatchSettings<'a> {
    pub collection: &'a str,
    pub branch: &'a str,
    pub transactional: bool,
    pub enable_uuid: bool,
    pub author: Option<&'a str>,
    pub on_exists: OnFeatureExists,
    pub on_not_exists: OnFeatureNotExists,
    pub default_floor: u32,
}

impl BatchSettings<'_> {
    /// Hints only relax non-transactional batches.
    fn on_exists(&self) -> OnFeatureExists {
        if self.transactional {
            OnFeatureExists::Error
        } else {
            self.on_exists
        }
    }

    fn on_not_exists(&self) -> OnFeatureNotExists {
        if self.transactional {
            OnFeatureNotExists::Error
        } else {
            self.on_not_exists
        }
    }
}

/// Per-attempt state shared by every item of the batch.
struct BatchContext<'a> {
    settings: &'a BatchSettings<'a>,
    node_id: u32,
    chain: Vec<(u32, u64)>,
    version: u64,
    bound: RetentionBound,
    now: i64,
}

enum ItemError {
    Failed(FailureKind),
    Store(StoreError),
}

impl From<StoreError> for ItemError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for ItemError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(value.into())
    }
}

enum Applied {
    Inserted(Feature),
    Updated(Feature),
    Deleted,
    Retained,
}

enum Outcome {
    Applied(Applied),
    Failed(FailureKind),
}

/// Runs one attempt of the batch inside `conn`'s open write transaction.
pub(super) fn apply_batch_tx(
    conn: &Connection,
    settings: &BatchSettings<'_>,
    items: &[PlannedItem],
) -> Result<ModifyFeaturesResponse, StoreError> {
    let config = load_collection_tx(conn, settings.collection)?;
    let branch = load_branch_tx(conn, settings.collection, settings.branch)?;
    let ctx = BatchContext {
        settings,
        node_id: branch.node_id,
        chain: branch_chain_tx(conn, settings.collection, &branch, branch.head_version)?,
        version: branch.head_version + 1,
        bound: config.history.bound(settings.default_floor),
        now: now_ms(),
    };

    // Items after a transactional failure still run so each one reports its
    // own failure; the batch savepoint discards their effects afterwards.
    conn.execute_batch("SAVEPOINT sv_batch")?;
    let mut outcomes = Vec::with_capacity(items.len());
    let mut aborted = false;
    for item in items {
        if let Some(rejection) = &item.rejected {
            outcomes.push(Outcome::Failed(rejection.clone()));
            aborted |= settings.transactional;
            continue;
        }

        conn.execute_batch("SAVEPOINT sv_item")?;
        match apply_item_tx(conn, &ctx, item) {
            Ok(applied) => {
                conn.execute_batch("RELEASE sv_item")?;
                outcomes.push(Outcome::Applied(applied));
            }
            Err(ItemError::Failed(kind)) => {
                conn.execute_batch("ROLLBACK TO sv_item; RELEASE sv_item")?;
                outcomes.push(Outcome::Failed(kind));
                aborted |= settings.transactional;
            }
            Err(ItemError::Store(err)) => return Err(err),
        }
    }

    if aborted {
        conn.execute_batch("ROLLBACK TO sv_batch; RELEASE sv_batch")?;
        tracing::warn!(
            collection = settings.collection,
            branch = settings.branch,
            items = items.len(),
            "transactional batch aborted"
        );
        return Ok(aborted_response(items, outcomes));
    }
    conn.execute_batch("RELEASE sv_batch")?;

    let mut response = ModifyFeaturesResponse::default();
    let mut failed = Vec::new();
    let mut changed = false;
    for (item, outcome) in items.iter().zip(outcomes) {
        match outcome {
            Outcome::Applied(Applied::Inserted(feature)) => {
                changed = true;
                response.inserted.push(item.id.clone());
                response.features.push(feature);
            }
            Outcome::Applied(Applied::Updated(feature)) => {
                changed = true;
                response.updated.push(item.id.clone());
                response.features.push(feature);
            }
            Outcome::Applied(Applied::Deleted) => {
                changed = true;
                response.deleted.push(item.id.clone());
            }
            Outcome::Applied(Applied::Retained) => {}
            Outcome::Failed(kind) => failed.push(ModificationFailure::new(&item.id, &kind)),
        }
    }

    if changed {
        conn.execute(
            "UPDATE branches SET head_version=?3 WHERE collection=?1 AND id=?2",
            params![settings.collection, settings.branch, to_sqlite_i64(ctx.version)?],
        )?;
        response.version = Some(ctx.version);
    }
    if !failed.is_empty() {
        response.failed = Some(failed);
    }
    Ok(response)
}

/// Failing items keep their reason; items that would have applied report the abort.
fn aborted_response(items: &[PlannedItem], outcomes: Vec<Outcome>) -> ModifyFeaturesResponse {
    let failed = items
        .iter()
        .zip(outcomes)
        .map(|(item, outcome)| match outcome {
            Outcome::Failed(kind) => ModificationFailure::new(&item.id, &kind),
            Outcome::Applied(_) => ModificationFailure::new(&item.id, &FailureKind::TransactionAborted),
        })
        .collect();
    ModifyFeaturesResponse {
        failed: Some(failed),
        ..ModifyFeaturesResponse::default()
    }
}

fn apply_item_tx(
    conn: &Connection,
    ctx: &BatchContext<'_>,
    item: &PlannedItem,
) -> Result<Applied, ItemError> {
    let current = visible_state_tx(conn, ctx.settings.collection, &ctx.chain, &item.id)?;
    match &item.kind {
        ItemKind::Insert(feature) => match current {
            None => insert_tx(conn, ctx, &item.id, feature),
            Some(prior) => match ctx.settings.on_exists() {
                OnFeatureExists::Error => Err(ItemError::Failed(FailureKind::AlreadyExists)),
                OnFeatureExists::Replace => update_tx(conn, ctx, &item.id, feature, prior),
                OnFeatureExists::Retain => Ok(Applied::Retained),
            },
        },
        ItemKind::Update(feature) => {
            let expected = expected_uuid(ctx, feature.expected_uuid());
            match current {
                Some(prior) => {
                    check_uuid(expected, &prior)?;
                    update_tx(conn, ctx, &item.id, feature, prior)
                }
                None if expected.is_some() => Err(ItemError::Failed(FailureKind::UuidMismatch)),
                None => match ctx.settings.on_not_exists() {
                    OnFeatureNotExists::Error => Err(ItemError::Failed(FailureKind::NotExists)),
                    OnFeatureNotExists::Create => insert_tx(conn, ctx, &item.id, feature),
                    OnFeatureNotExists::Retain => Ok(Applied::Retained),
                },
            }
        }
        ItemKind::Upsert(feature) => match current {
            Some(prior) => {
                check_uuid(expected_uuid(ctx, feature.expected_uuid()), &prior)?;
                update_tx(conn, ctx, &item.id, feature, prior)
            }
            None => insert_tx(conn, ctx, &item.id, feature),
        },
        ItemKind::Delete { expected } => {
            let expected = expected_uuid(ctx, expected.as_deref());
            match current {
                Some(prior) => {
                    check_uuid(expected, &prior)?;
                    delete_tx(conn, ctx, prior)
                }
                None if expected.is_some() => Err(ItemError::Failed(FailureKind::UuidMismatch)),
                None => match ctx.settings.on_not_exists() {
                    OnFeatureNotExists::Error => Err(ItemError::Failed(FailureKind::NotExists)),
                    OnFeatureNotExists::Create | OnFeatureNotExists::Retain => Ok(Applied::Retained),
                },
            }
        }
    }
}

fn expected_uuid<'a>(ctx: &BatchContext<'_>, expected: Option<&'a str>) -> Option<&'a str> {
    expected.filter(|_| ctx.settings.enable_uuid)
}

fn check_uuid(expected: Option<&str>, prior: &StoredState) -> Result<(), ItemError> {
    match expected {
        Some(uuid) if uuid != prior.uuid => Err(ItemError::Failed(FailureKind::UuidMismatch)),
        _ => Ok(()),
    }
}

fn next_meta(ctx: &BatchContext<'_>, action: Action, prior: Option<&StoredState>) -> FeatureMeta {
    FeatureMeta {
        uuid: uuid::Uuid::new_v4().to_string(),
        puuid: prior.map(|p| p.uuid.clone()),
        version: ctx.version,
        action,
        deleted: action == Action::Delete,
        created_at: prior.map_or(ctx.now, |p| p.created_at_ms),
        updated_at: prior.map_or(ctx.now, |p| p.updated_at_ms.max(ctx.now)),
        author: ctx.settings.author.map(str::to_string),
    }
}

fn insert_tx(
    conn: &Connection,
    ctx: &BatchContext<'_>,
    id: &str,
    feature: &Feature,
) -> Result<Applied, ItemError> {
    let meta = next_meta(ctx, Action::Create, None);
    let state = StoredState::from_feature(feature, id, ctx.node_id, &meta)?;
    write_state_tx(conn, ctx.settings.collection, StateTable::Head, &state)?;
    Ok(Applied::Inserted(state.to_feature()?))
}

/// Only states owned by this branch's node are appended to its history.
fn update_tx(
    conn: &Connection,
    ctx: &BatchContext<'_>,
    id: &str,
    feature: &Feature,
    prior: StoredState,
) -> Result<Applied, ItemError> {
    let meta = next_meta(ctx, Action::Update, Some(&prior));
    let state = StoredState::from_feature(feature, id, ctx.node_id, &meta)?;
    if prior.node_id == ctx.node_id {
        record_superseded_tx(conn, ctx.settings.collection, ctx.bound, &[&prior])?;
    }
    write_state_tx(conn, ctx.settings.collection, StateTable::Head, &state)?;
    Ok(Applied::Updated(state.to_feature()?))
}

fn delete_tx(conn: &Connection, ctx: &BatchContext<'_>, prior: StoredState) -> Result<Applied, ItemError> {
    let meta = next_meta(ctx, Action::Delete, Some(&prior));
    let tombstone = StoredState {
        node_id: ctx.node_id,
        ..prior.successor(&meta)
    };
    if prior.node_id == ctx.node_id {
        record_superseded_tx(conn, ctx.settings.collection, ctx.bound, &[&prior, &tombstone])?;
    } else {
        record_superseded_tx(conn, ctx.settings.collection, ctx.bound, &[&tombstone])?;
    }
    write_state_tx(conn, ctx.settings.collection, StateTable::Head, &tombstone)?;
    Ok(Applied::Deleted)
}
