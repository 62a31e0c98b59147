#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::{BBox, Geometry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Version metadata of one stored state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMeta {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub puuid: Option<String>,
    pub version: u64,
    pub action: Action,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// Expected prior uuid on a write; everything else is assigned by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FeatureMeta>,
    /// Set by writers to request the uuid check against the stored HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<WriteMeta>,
}

impl Feature {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Ask the store to accept this write only if HEAD still has `uuid`.
    pub fn expecting(mut self, uuid: impl Into<String>) -> Self {
        self.expected = Some(WriteMeta {
            uuid: Some(uuid.into()),
        });
        self
    }

    /// Explicit expectation first, then the uuid of a state read back from the store.
    pub fn expected_uuid(&self) -> Option<&str> {
        self.expected
            .as_ref()
            .and_then(|m| m.uuid.as_deref())
            .or_else(|| self.uuid())
    }

    pub fn uuid(&self) -> Option<&str> {
        self.meta.as_ref().map(|m| m.uuid.as_str())
    }

    pub fn version(&self) -> Option<u64> {
        self.meta.as_ref().map(|m| m.version)
    }

    pub fn is_deleted(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.deleted)
    }

    /// Recompute derived fields before a write.
    pub fn normalize(&mut self) {
        self.bbox = self.geometry.as_ref().and_then(Geometry::bbox);
    }
}
