/*
[INPUT]:  YAML/JSON queue settings or programmatic defaults
[OUTPUT]: QueueConfig for OperationQueue construction
[POS]:    Configuration layer - container policy knobs
[UPDATE]: When adding new queue policy options
*/

use serde::{Deserialize, Serialize};

/// Settings for an [`OperationQueue`](crate::OperationQueue)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Name used in logs and errors
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Maximum operations running at once; `None` or 0 means unbounded
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_concurrent: None,
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    /// Effective concurrency limit
    pub fn concurrency_limit(&self) -> Option<usize> {
        self.max_concurrent.filter(|max| *max > 0)
    }
}

fn default_queue_name() -> String {
    "queue".to_string()
}
