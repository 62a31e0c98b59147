#![forbid(unsafe_code)]

use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use sv_core::feature::{Action, Feature, FeatureMeta};
use sv_core::geometry::BBox;

use super::super::StoreError;
use super::{to_sqlite_i64, u32_column, u64_column};

pub(in crate::store) const STATE_COLUMNS: &str = "id, node_id, uuid, puuid, version, action, deleted, \
     created_at_ms, updated_at_ms, author, geometry, properties, min_lon, min_lat, max_lon, max_lat";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(in crate::store) enum StateTable {
    Head,
    History,
}

impl StateTable {
    pub(in crate::store) fn name(self) -> &'static str {
        match self {
            Self::Head => "features",
            Self::History => "feature_history",
        }
    }
}

/// One persisted feature state, as stored in `features` or `feature_history`.
#[derive(Clone, Debug, PartialEq)]
pub(in crate::store) struct StoredState {
    pub id: String,
    pub node_id: u32,
    pub uuid: String,
    pub puuid: Option<String>,
    pub version: u64,
    pub action: Action,
    pub deleted: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub author: Option<String>,
    pub geometry: Option<String>,
    pub properties: String,
    pub bbox: Option<BBox>,
}

impl StoredState {
    /// Expects the columns in `STATE_COLUMNS` order.
    pub(in crate::store) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let action_raw: String = row.get(5)?;
        let action = Action::parse(&action_raw)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(5, "action".to_string(), Type::Text))?;
        let bbox = match (
            row.get::<_, Option<f64>>(12)?,
            row.get::<_, Option<f64>>(13)?,
            row.get::<_, Option<f64>>(14)?,
            row.get::<_, Option<f64>>(15)?,
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => Some(BBox::from([a, b, c, d])),
            _ => None,
        };
        Ok(Self {
            id: row.get(0)?,
            node_id: u32_column(1, row.get(1)?)?,
            uuid: row.get(2)?,
            puuid: row.get(3)?,
            version: u64_column(4, row.get(4)?)?,
            action,
            deleted: row.get::<_, i64>(6)? != 0,
            created_at_ms: row.get(7)?,
            updated_at_ms: row.get(8)?,
            author: row.get(9)?,
            geometry: row.get(10)?,
            properties: row.get(11)?,
            bbox,
        })
    }

    /// Serializes the content of `feature`; metadata comes from `meta`.
    pub(in crate::store) fn from_feature(
        feature: &Feature,
        id: &str,
        node_id: u32,
        meta: &FeatureMeta,
    ) -> Result<Self, StoreError> {
        let geometry = feature
            .geometry
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(Self {
            id: id.to_string(),
            node_id,
            uuid: meta.uuid.clone(),
            puuid: meta.puuid.clone(),
            version: meta.version,
            action: meta.action,
            deleted: meta.deleted,
            created_at_ms: meta.created_at,
            updated_at_ms: meta.updated_at,
            author: meta.author.clone(),
            geometry,
            properties: serde_json::to_string(&feature.properties)?,
            bbox: feature.bbox,
        })
    }

    pub(in crate::store) fn meta(&self) -> FeatureMeta {
        FeatureMeta {
            uuid: self.uuid.clone(),
            puuid: self.puuid.clone(),
            version: self.version,
            action: self.action,
            deleted: self.deleted,
            created_at: self.created_at_ms,
            updated_at: self.updated_at_ms,
            author: self.author.clone(),
        }
    }

    pub(in crate::store) fn to_feature(&self) -> Result<Feature, StoreError> {
        Ok(Feature {
            id: Some(self.id.clone()),
            geometry: self
                .geometry
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            properties: serde_json::from_str(&self.properties)?,
            bbox: self.bbox,
            meta: Some(self.meta()),
            expected: None,
        })
    }

    /// Same content under new metadata.
    pub(in crate::store) fn successor(&self, meta: &FeatureMeta) -> Self {
        Self {
            uuid: meta.uuid.clone(),
            puuid: meta.puuid.clone(),
            version: meta.version,
            action: meta.action,
            deleted: meta.deleted,
            created_at_ms: meta.created_at,
            updated_at_ms: meta.updated_at,
            author: meta.author.clone(),
            ..self.clone()
        }
    }
}

pub(in crate::store) fn write_state_tx(
    conn: &Connection,
    collection: &str,
    table: StateTable,
    state: &StoredState,
) -> Result<(), StoreError> {
    let [min_lon, min_lat, max_lon, max_lat] = match state.bbox {
        Some(b) => <[f64; 4]>::from(b).map(Some),
        None => [None; 4],
    };
    let sql = format!(
        "INSERT OR REPLACE INTO {}(collection, {STATE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        table.name()
    );
    conn.prepare_cached(&sql)?.execute(params![
        collection,
        state.id,
        state.node_id,
        state.uuid,
        state.puuid,
        to_sqlite_i64(state.version)?,
        state.action.as_str(),
        state.deleted,
        state.created_at_ms,
        state.updated_at_ms,
        state.author,
        state.geometry,
        state.properties,
        min_lon,
        min_lat,
        max_lon,
        max_lat,
    ])?;
    Ok(())
}
