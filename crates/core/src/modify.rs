#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::feature::Feature;
use crate::refs::MAIN_BRANCH;

pub const UUID_MISMATCH: &str = "Object does not exist or UUID mismatch";
pub const TRANSACTION_FAILED: &str = "Transaction has failed";
pub const NOT_EXISTS: &str = "Object does not exist";
pub const ALREADY_EXISTS: &str = "Object already exists";

/// What to do when an inserted feature already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnFeatureExists {
    #[default]
    Error,
    Replace,
    Retain,
}

/// What to do when an updated or deleted feature does not exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnFeatureNotExists {
    #[default]
    Error,
    Create,
    Retain,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyFeaturesRequest {
    /// Target collection.
    pub space: String,
    #[serde(default)]
    pub transaction: bool,
    #[serde(default, rename = "enableUUID")]
    pub enable_uuid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub insert_features: Vec<Feature>,
    #[serde(default)]
    pub update_features: Vec<Feature>,
    #[serde(default)]
    pub upsert_features: Vec<Feature>,
    /// Feature id to expected uuid; `None` skips the uuid check.
    #[serde(default)]
    pub delete_features: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub on_feature_exists: OnFeatureExists,
    #[serde(default)]
    pub on_feature_not_exists: OnFeatureNotExists,
}

impl ModifyFeaturesRequest {
    pub fn new(space: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            ..Self::default()
        }
    }

    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or(MAIN_BRANCH)
    }

    pub fn is_empty(&self) -> bool {
        self.insert_features.is_empty()
            && self.update_features.is_empty()
            && self.upsert_features.is_empty()
            && self.delete_features.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.insert_features.len()
            + self.update_features.len()
            + self.upsert_features.len()
            + self.delete_features.len()
    }
}

/// Why a single item was not applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    UuidMismatch,
    NotExists,
    AlreadyExists,
    TransactionAborted,
    Rejected(String),
}

impl FailureKind {
    pub fn message(&self) -> &str {
        match self {
            Self::UuidMismatch => UUID_MISMATCH,
            Self::NotExists => NOT_EXISTS,
            Self::AlreadyExists => ALREADY_EXISTS,
            Self::TransactionAborted => TRANSACTION_FAILED,
            Self::Rejected(reason) => reason,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationFailure {
    pub id: String,
    pub message: String,
}

impl ModificationFailure {
    pub fn new(id: impl Into<String>, kind: &FailureKind) -> Self {
        Self {
            id: id.into(),
            message: kind.message().to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyFeaturesResponse {
    /// States produced by inserts and updates, in application order.
    pub features: Vec<Feature>,
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<Vec<ModificationFailure>>,
    /// Version stamped on this request's writes; `None` when nothing was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl ModifyFeaturesResponse {
    pub fn failures(&self) -> &[ModificationFailure] {
        self.failed.as_deref().unwrap_or_default()
    }

    pub fn failure_for(&self, id: &str) -> Option<&str> {
        self.failures()
            .iter()
            .find(|f| f.id == id)
            .map(|f| f.message.as_str())
    }

    pub fn success_count(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_wire_names_and_defaults() {
        let raw = r#"{
            "space": "roads",
            "enableUUID": true,
            "updateFeatures": [{"id": "a", "expected": {"uuid": "u1"}}],
            "deleteFeatures": {"b": null, "c": "u9"},
            "onFeatureExists": "Retain"
        }"#;
        let req: ModifyFeaturesRequest = serde_json::from_str(raw).unwrap();
        assert!(req.enable_uuid);
        assert!(!req.transaction);
        assert_eq!(req.branch(), "main");
        assert_eq!(req.update_features[0].expected_uuid(), Some("u1"));
        assert_eq!(req.delete_features["b"], None);
        assert_eq!(req.delete_features["c"].as_deref(), Some("u9"));
        assert_eq!(req.on_feature_exists, OnFeatureExists::Retain);
        assert_eq!(req.on_feature_not_exists, OnFeatureNotExists::Error);
        assert_eq!(req.item_count(), 3);
    }

    #[test]
    fn response_omits_failed_when_none() {
        let resp = ModifyFeaturesResponse {
            inserted: vec!["a".to_string()],
            ..ModifyFeaturesResponse::default()
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("failed").is_none());
        assert_eq!(resp.failure_for("a"), None);
        assert_eq!(resp.success_count(), 1);
    }

    #[test]
    fn failure_messages() {
        let f = ModificationFailure::new("a", &FailureKind::UuidMismatch);
        assert_eq!(f.message, "Object does not exist or UUID mismatch");
        assert_eq!(FailureKind::TransactionAborted.message(), "Transaction has failed");
        assert_eq!(FailureKind::Rejected("bad".to_string()).message(), "bad");
    }
}
