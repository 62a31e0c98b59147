#![forbid(unsafe_code)]

//! Batched feature writes with uuid-chain optimistic concurrency.
//!
//! Features are validated and run through the collection's processors first;
//! the batch then executes in one retried write transaction with a savepoint
//! per item. A transactional batch rolls back to the batch savepoint on the
//! first failed item; otherwise failed items are rolled back on their own.

mod apply;

use std::collections::BTreeSet;

use super::collections::find_collection_tx;
use super::exec::ExecOptions;
use super::*;
use sv_core::feature::Feature;
use sv_core::modify::{FailureKind, ModifyFeaturesRequest, ModifyFeaturesResponse};

use apply::{BatchSettings, apply_batch_tx};

#[derive(Clone, Debug)]
pub(super) enum ItemKind {
    Insert(Feature),
    Update(Feature),
    Upsert(Feature),
    Delete { expected: Option<String> },
}

/// One request item after id checks and processors.
#[derive(Clone, Debug)]
pub(super) struct PlannedItem {
    pub id: String,
    pub kind: ItemKind,
    /// Set when a processor refused the feature.
    pub rejected: Option<FailureKind>,
}

impl FeatureStore {
    pub fn modify_features(
        &self,
        request: ModifyFeaturesRequest,
    ) -> Result<ModifyFeaturesResponse, StoreError> {
        self.modify_features_with(request, ExecOptions::new("modify_features"))
    }

    /// Same as [`FeatureStore::modify_features`] with explicit execution
    /// options, e.g. a query id for [`FeatureStore::cancel`].
    pub fn modify_features_with(
        &self,
        request: ModifyFeaturesRequest,
        options: ExecOptions,
    ) -> Result<ModifyFeaturesResponse, StoreError> {
        let collection = canonicalize_collection(&request.space)?;
        let branch = canonicalize_branch(request.branch())?;
        if request.is_empty() {
            return Ok(ModifyFeaturesResponse::default());
        }

        let config = self
            .executor
            .snapshot(ExecOptions::new("modify_features.config"), |tx| {
                find_collection_tx(tx, &collection)
            })?
            .ok_or(StoreError::UnknownCollection)?;
        let processors = self.processors.resolve(&config.processors)?;

        let mut items = plan_items(&request)?;
        for item in &mut items {
            let (operation, feature) = match &mut item.kind {
                ItemKind::Insert(feature) => (WriteOperation::Insert, feature),
                ItemKind::Update(feature) => (WriteOperation::Update, feature),
                ItemKind::Upsert(feature) => (WriteOperation::Upsert, feature),
                ItemKind::Delete { .. } => continue,
            };
            feature.id = Some(item.id.clone());
            feature.normalize();
            for processor in &processors {
                if let Err(message) = processor.process(operation, feature) {
                    tracing::debug!(
                        collection = %collection,
                        feature = %item.id,
                        processor = processor.id(),
                        "feature rejected: {message}"
                    );
                    item.rejected = Some(FailureKind::Rejected(message));
                    break;
                }
            }
            feature.normalize();
        }

        let settings = BatchSettings {
            collection: &collection,
            branch: &branch,
            transactional: request.transaction,
            enable_uuid: request.enable_uuid,
            author: request.author.as_deref(),
            on_exists: request.on_feature_exists,
            on_not_exists: request.on_feature_not_exists,
            default_floor: self.config.default_max_version_count,
        };
        let response = self
            .executor
            .transaction(options, |tx| apply_batch_tx(tx, &settings, &items))?;

        tracing::info!(
            collection = %collection,
            branch = %branch,
            version = ?response.version,
            inserted = response.inserted.len(),
            updated = response.updated.len(),
            deleted = response.deleted.len(),
            failed = response.failures().len(),
            "features modified"
        );
        Ok(response)
    }
}

/// Items in application order: inserts, upserts, updates, deletes.
fn plan_items(request: &ModifyFeaturesRequest) -> Result<Vec<PlannedItem>, StoreError> {
    let mut items = Vec::with_capacity(request.item_count());
    let mut seen = BTreeSet::new();
    let mut push = |id: String, kind: ItemKind| -> Result<(), StoreError> {
        let id = canonicalize_feature_id(&id)?;
        if !seen.insert(id.clone()) {
            return Err(StoreError::InvalidInput("duplicate feature id in request"));
        }
        items.push(PlannedItem {
            id,
            kind,
            rejected: None,
        });
        Ok(())
    };

    for feature in &request.insert_features {
        let id = feature
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        push(id, ItemKind::Insert(feature.clone()))?;
    }
    for feature in &request.upsert_features {
        let id = feature
            .id
            .clone()
            .ok_or(StoreError::InvalidInput("upserted features need an id"))?;
        push(id, ItemKind::Upsert(feature.clone()))?;
    }
    for feature in &request.update_features {
        let id = feature
            .id
            .clone()
            .ok_or(StoreError::InvalidInput("updated features need an id"))?;
        push(id, ItemKind::Update(feature.clone()))?;
    }
    for (id, expected) in &request.delete_features {
        push(
            id.clone(),
            ItemKind::Delete {
                expected: expected.clone(),
            },
        )?;
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_orders_items_and_assigns_missing_insert_ids() {
        let mut request = ModifyFeaturesRequest::new("roads");
        request.delete_features.insert("d".to_string(), None);
        request.update_features.push(Feature::new("u"));
        request.insert_features.push(Feature::default());
        request.upsert_features.push(Feature::new("s"));

        let items = plan_items(&request).expect("plan");
        let kinds: Vec<&str> = items
            .iter()
            .map(|item| match item.kind {
                ItemKind::Insert(_) => "insert",
                ItemKind::Upsert(_) => "upsert",
                ItemKind::Update(_) => "update",
                ItemKind::Delete { .. } => "delete",
            })
            .collect();
        assert_eq!(kinds, vec!["insert", "upsert", "update", "delete"]);
        assert!(uuid::Uuid::parse_str(&items[0].id).is_ok());
    }

    #[test]
    fn plan_rejects_duplicates_and_blank_ids() {
        let mut request = ModifyFeaturesRequest::new("roads");
        request.insert_features.push(Feature::new("a"));
        request.delete_features.insert("a".to_string(), None);
        assert!(matches!(
            plan_items(&request),
            Err(StoreError::InvalidInput("duplicate feature id in request"))
        ));

        let mut request = ModifyFeaturesRequest::new("roads");
        request.update_features.push(Feature::new("  "));
        assert!(matches!(
            plan_items(&request),
            Err(StoreError::InvalidInput("invalid feature id"))
        ));

        let mut request = ModifyFeaturesRequest::new("roads");
        request.update_features.push(Feature::default());
        assert!(plan_items(&request).is_err());
    }
}
