//! Work items produced by a work source.

use serde::{Deserialize, Serialize};

/// One unit of work destined for a project's worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Stable project identifier; keys the session name.
    pub project_id: String,
    /// Human-readable project name; used for directory fallback.
    pub project_name: String,
    /// Prompt text delivered to the worker.
    pub prompt: String,
}

impl WorkItem {
    /// Convenience constructor.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        project_name: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            project_name: project_name.into(),
            prompt: prompt.into(),
        }
    }
}
