#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::retention::HistorySettings;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    pub id: String,
    #[serde(flatten)]
    pub history: HistorySettings,
    /// Processor ids applied, in order, to inserted and updated features.
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub created_at_ms: i64,
}

impl CollectionConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: HistorySettings::default(),
            processors: Vec::new(),
            created_at_ms: 0,
        }
    }

    pub fn with_history(mut self, history: HistorySettings) -> Self {
        self.history = history;
        self
    }

    pub fn with_processor(mut self, processor: impl Into<String>) -> Self {
        self.processors.push(processor.into());
        self
    }
}
