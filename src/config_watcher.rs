//! Hot-reload watcher for project settings in `config.toml`.
//!
//! [`ConfigWatcher`] uses the `notify` crate to watch `config.toml` for
//! file-system changes. When a change is detected it re-parses only the
//! `[[project]]` entries and the `[directory_overrides]` table and swaps
//! them into the shared `Arc<RwLock<ProjectTable>>`.
//!
//! Worker launch settings and dispatch timing still require a restart.
//!
//! The shared lock is a `std::sync::RwLock` so the synchronous `notify`
//! callback can update it without an async context.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{ProjectSettings, ProjectTable};
use crate::{AppError, Result};

/// Minimal TOML structure used for hot-reload parsing; other keys are ignored.
#[derive(Debug, Deserialize)]
struct ProjectsOnlyConfig {
    #[serde(default, rename = "project")]
    projects: Vec<ProjectSettings>,
    #[serde(default)]
    directory_overrides: HashMap<String, String>,
}

/// Parse the hot-reloadable sections from a TOML file.
///
/// # Errors
///
/// Returns `AppError::Config` if the file cannot be read, the sections are
/// invalid TOML, or project ids are empty or duplicated.
pub fn parse_project_table(path: &Path) -> Result<ProjectTable> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        AppError::Config(format!("failed to read config for project hot-reload: {err}"))
    })?;
    let parsed: ProjectsOnlyConfig = toml::from_str(&raw).map_err(|err| {
        AppError::Config(format!("failed to parse project settings from config: {err}"))
    })?;
    let table = ProjectTable {
        projects: parsed.projects,
        directory_overrides: parsed.directory_overrides,
    };
    table.validate()?;
    Ok(table)
}

fn is_config_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Hot-reload watcher for the project table.
///
/// Dropping a `ConfigWatcher` stops the underlying OS watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    table: Arc<RwLock<ProjectTable>>,
}

impl ConfigWatcher {
    /// Watch `config_path`, starting from `initial`.
    ///
    /// A reload that fails to parse keeps the previous table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the `notify` watcher cannot be created
    /// or the path cannot be watched.
    pub fn new(config_path: &Path, initial: ProjectTable) -> Result<Self> {
        let table = Arc::new(RwLock::new(initial));
        let table_for_callback = Arc::clone(&table);
        let path_for_callback: PathBuf = config_path.to_path_buf();
        let file_name = config_path.file_name().map(std::ffi::OsStr::to_os_string);

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_config_change(&event) => {
                    let touches_config = file_name.as_ref().is_none_or(|name| {
                        event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str()))
                    });
                    if !touches_config {
                        return;
                    }
                    match parse_project_table(&path_for_callback) {
                        Ok(reloaded) => match table_for_callback.write() {
                            Ok(mut guard) => {
                                let projects = reloaded.projects.len();
                                *guard = reloaded;
                                info!(
                                    path = %path_for_callback.display(),
                                    projects,
                                    "hot-reloaded project settings"
                                );
                            }
                            Err(err) => {
                                warn!(%err, "project table lock poisoned during hot-reload");
                            }
                        },
                        Err(err) => {
                            warn!(
                                %err,
                                path = %path_for_callback.display(),
                                "failed to reload project settings, keeping previous values"
                            );
                        }
                    }
                }
                Err(err) => warn!(%err, "config file watcher error"),
                _ => {}
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create config file watcher: {err}")))?;

        // Watch the parent so rename-based saves are seen.
        let watch_target = config_path
            .parent()
            .filter(|p| p != &Path::new(""))
            .unwrap_or(config_path);

        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch config path '{}': {err}",
                    watch_target.display()
                ))
            })?;

        info!(path = %config_path.display(), "config watcher started");

        Ok(Self {
            _watcher: watcher,
            table,
        })
    }

    /// Shared handle to the live project table.
    #[must_use]
    pub fn table(&self) -> Arc<RwLock<ProjectTable>> {
        Arc::clone(&self.table)
    }
}
