#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};

use super::super::StoreError;

pub(in crate::store) const SCHEMA_VERSION: i64 = 1;

const TABLES: [&str; 7] = [
    "store_meta",
    "collections",
    "branches",
    "branch_merges",
    "tags",
    "features",
    "feature_history",
];

/// Fails closed on databases written by anything but this schema.
pub(in crate::store) fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tables.insert(row.get::<_, String>(0)?);
    }

    if tables.is_empty() {
        return Ok(());
    }

    let required: BTreeSet<&str> = TABLES.into_iter().collect();
    if tables
        .iter()
        .any(|table| !required.contains(table.as_str()))
    {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: unsupported tables detected",
        ));
    }
    if required.iter().any(|table| !tables.contains(*table)) {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: required table is missing",
        ));
    }

    let version = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key='schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match version.map(|v| v.parse::<i64>()) {
        Some(Ok(v)) if v == SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
        None => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version row is missing",
        )),
    }
}

pub(in crate::store) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collections (
          id TEXT PRIMARY KEY,
          enable_history INTEGER NOT NULL,
          max_version_count INTEGER,
          versions_to_keep INTEGER,
          processors TEXT NOT NULL DEFAULT '[]',
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branches (
          collection TEXT NOT NULL,
          id TEXT NOT NULL,
          node_id INTEGER NOT NULL,
          base_branch TEXT,
          base_node_id INTEGER,
          base_version INTEGER,
          state TEXT NOT NULL DEFAULT 'NORMAL',
          conflict_solving_branch TEXT,
          head_version INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          PRIMARY KEY(collection, id),
          UNIQUE(collection, node_id),
          FOREIGN KEY(collection) REFERENCES collections(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS branch_merges (
          collection TEXT NOT NULL,
          branch TEXT NOT NULL,
          version INTEGER NOT NULL,
          source_ref TEXT NOT NULL,
          PRIMARY KEY(collection, branch, version),
          FOREIGN KEY(collection, branch) REFERENCES branches(collection, id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS tags (
          collection TEXT NOT NULL,
          id TEXT NOT NULL,
          branch TEXT NOT NULL,
          version INTEGER NOT NULL,
          system INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL,
          PRIMARY KEY(collection, id),
          FOREIGN KEY(collection) REFERENCES collections(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS features (
          collection TEXT NOT NULL,
          node_id INTEGER NOT NULL,
          id TEXT NOT NULL,
          uuid TEXT NOT NULL,
          puuid TEXT,
          version INTEGER NOT NULL,
          action TEXT NOT NULL,
          deleted INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          author TEXT,
          geometry TEXT,
          properties TEXT NOT NULL,
          min_lon REAL,
          min_lat REAL,
          max_lon REAL,
          max_lat REAL,
          PRIMARY KEY(collection, node_id, id),
          FOREIGN KEY(collection) REFERENCES collections(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS feature_history (
          collection TEXT NOT NULL,
          node_id INTEGER NOT NULL,
          id TEXT NOT NULL,
          uuid TEXT NOT NULL,
          puuid TEXT,
          version INTEGER NOT NULL,
          action TEXT NOT NULL,
          deleted INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          author TEXT,
          geometry TEXT,
          properties TEXT NOT NULL,
          min_lon REAL,
          min_lat REAL,
          max_lon REAL,
          max_lat REAL,
          PRIMARY KEY(collection, node_id, id, version),
          FOREIGN KEY(collection) REFERENCES collections(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS feature_history_retention
          ON feature_history(collection, node_id, id, updated_at_ms DESC, version DESC);
        CREATE INDEX IF NOT EXISTS features_uuid ON features(collection, uuid);
        CREATE INDEX IF NOT EXISTS branches_base ON branches(collection, base_branch);
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO store_meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
