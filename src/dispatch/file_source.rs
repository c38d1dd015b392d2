//! Work source backed by a JSON file.
//!
//! The file holds a JSON array of `{"projectId", "projectName", "prompt"}`
//! objects and is re-read on every fetch, so an external process can rewrite
//! it between cycles. A missing file means no work. Items with a blank prompt
//! are ignored.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::debug;

use crate::dispatch::WorkSource;
use crate::models::work::WorkItem;
use crate::{AppError, Result};

/// Reads the work list from a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileWorkSource {
    path: PathBuf,
}

impl JsonFileWorkSource {
    /// Source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Watched file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<WorkItem>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "work file absent, nothing to dispatch");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to read work file {}: {err}",
                    self.path.display()
                )))
            }
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let items: Vec<WorkItem> = serde_json::from_str(&raw).map_err(|err| {
            AppError::Io(format!("invalid work file {}: {err}", self.path.display()))
        })?;

        Ok(items
            .into_iter()
            .filter(|item| !item.prompt.trim().is_empty())
            .collect())
    }
}

impl WorkSource for JsonFileWorkSource {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        Box::pin(self.load())
    }
}
