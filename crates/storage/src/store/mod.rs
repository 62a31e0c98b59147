#![forbid(unsafe_code)]

mod branches;
mod collections;
mod config;
mod error;
pub mod exec;
mod history;
mod modify;
mod processors;
mod read;
mod refs;
mod requests;
mod support;
mod tags;

pub use config::*;
pub use error::*;
pub use processors::{FeatureProcessor, GeometryValidator, ProcessorRegistry, WriteOperation};
pub use refs::{ResolvedRef, VersionSelection};
pub use requests::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use exec::{ExecOptions, Executor, FileSource};
use support::*;

/// Versioned feature storage over one SQLite database.
///
/// Cheap to share: every operation takes `&self` and checks a connection out
/// of the executor's pools for the duration of one call.
#[derive(Debug)]
pub struct FeatureStore {
    executor: Executor,
    processors: ProcessorRegistry,
    config: StoreConfig,
    storage_dir: PathBuf,
}

impl FeatureStore {
    /// Opens with environment overrides and the default processors.
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(
            storage_dir,
            StoreConfig::from_env(),
            ProcessorRegistry::with_defaults(),
        )
    }

    pub fn open_with(
        storage_dir: impl AsRef<Path>,
        config: StoreConfig,
        processors: ProcessorRegistry,
    ) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(&config.db_file_name);
        let source = Arc::new(FileSource::new(db_path.clone(), config.busy_timeout));
        let executor = Executor::new(source, &config)?;

        executor.transaction(ExecOptions::new("install_schema"), |tx| {
            preflight_gate(tx)?;
            install_schema(tx)
        })?;

        tracing::info!(
            path = %db_path.display(),
            schema_version = SCHEMA_VERSION,
            processors = processors.len(),
            "feature store opened"
        );

        Ok(Self {
            executor,
            processors,
            config,
            storage_dir,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    /// The execution substrate, for callers that issue their own statements.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Interrupts the in-flight operation started with `query_id`.
    pub fn cancel(&self, query_id: &str) -> bool {
        self.executor.cancel(query_id)
    }
}
