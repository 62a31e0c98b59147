#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use sv_core::feature::Feature;
use sv_core::geometry::Validate;

use super::StoreError;

/// Which kind of write a processor is looking at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOperation {
    Insert,
    Update,
    Upsert,
}

/// Pluggable step run on every inserted or updated feature of a collection
/// that lists it, before the write transaction starts.
///
/// `Err` rejects the feature with the returned message.
pub trait FeatureProcessor: Send + Sync {
    fn id(&self) -> &str;

    fn process(&self, operation: WriteOperation, feature: &mut Feature) -> Result<(), String>;
}

/// Rejects features whose geometry is malformed.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeometryValidator;

impl GeometryValidator {
    pub const ID: &'static str = "geometry-validator";
}

impl FeatureProcessor for GeometryValidator {
    fn id(&self) -> &str {
        Self::ID
    }

    fn process(&self, _operation: WriteOperation, feature: &mut Feature) -> Result<(), String> {
        match &feature.geometry {
            Some(geometry) => geometry
                .validate()
                .map_err(|err| err.to_string()),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Arc<dyn FeatureProcessor>>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.processors.keys()).finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(GeometryValidator);
        registry
    }

    /// Returns the processor previously registered under the same id.
    pub fn register(
        &mut self,
        processor: impl FeatureProcessor + 'static,
    ) -> Option<Arc<dyn FeatureProcessor>> {
        let processor: Arc<dyn FeatureProcessor> = Arc::new(processor);
        self.processors.insert(processor.id().to_string(), processor)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn FeatureProcessor>> {
        self.processors.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Looks up `ids` in order; the first unknown id fails the lookup.
    pub fn resolve(&self, ids: &[String]) -> Result<Vec<Arc<dyn FeatureProcessor>>, StoreError> {
        ids.iter()
            .map(|id| {
                self.get(id)
                    .ok_or_else(|| StoreError::UnknownProcessor(id.clone()))
            })
            .collect()
    }
}
