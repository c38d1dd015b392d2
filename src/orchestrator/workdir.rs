//! Worker working-directory resolution.
//!
//! Precedence, first match wins:
//!
//! 1. Explicit path for the project (`~` expanded, relative paths joined to
//!    the shared root).
//! 2. Override table entry keyed by project id, then project name. Absolute
//!    overrides are used as-is; relative ones are joined to the root.
//! 3. Strict policy: nothing resolved is a [`AppError::Directory`] error.
//! 4. Lenient policy: `root/<project name>`, then the bare root, then the
//!    caller's own working directory.
//!
//! A candidate that does not exist (or is not a directory) is fatal under
//! strict policy and a logged fall-through under lenient policy. The resolver
//! only inspects the file system; it never creates directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{AppError, Result};

/// Where a worker will run, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkDir {
    /// Explicit per-project path.
    Explicit(PathBuf),
    /// Entry from the override table.
    Override(PathBuf),
    /// `root/<project name>` fallback.
    ProjectUnderRoot(PathBuf),
    /// Bare shared root fallback.
    Root(PathBuf),
    /// Inherit the supervisor's working directory.
    Inherit,
}

impl WorkDir {
    /// Concrete directory, `None` for [`WorkDir::Inherit`].
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Explicit(p) | Self::Override(p) | Self::ProjectUnderRoot(p) | Self::Root(p) => {
                Some(p)
            }
            Self::Inherit => None,
        }
    }
}

/// Inputs for a single resolution.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryRequest<'a> {
    /// Project identifier; first override key.
    pub project_id: &'a str,
    /// Project name; second override key and fallback directory name.
    pub project_name: &'a str,
    /// Explicit path, if configured.
    pub explicit: Option<&'a str>,
    /// Override table.
    pub overrides: &'a HashMap<String, String>,
    /// Shared root.
    pub root: Option<&'a Path>,
    /// Strict policy.
    pub strict: bool,
}

/// Resolve the working directory for one project.
///
/// # Errors
///
/// Under strict policy only: `AppError::Directory` when a configured path does
/// not exist or when nothing resolves at all.
pub fn resolve(request: &DirectoryRequest<'_>) -> Result<WorkDir> {
    let root = request.root.map(expand_home);

    if let Some(explicit) = request.explicit {
        let candidate = anchor(expand_home(Path::new(explicit)), root.as_deref());
        if let Some(path) = check(&candidate, "explicit path", request)? {
            return Ok(WorkDir::Explicit(path));
        }
    }

    let override_entry = request
        .overrides
        .get(request.project_id)
        .or_else(|| request.overrides.get(request.project_name));
    if let Some(raw) = override_entry {
        let candidate = anchor(expand_home(Path::new(raw)), root.as_deref());
        if let Some(path) = check(&candidate, "directory override", request)? {
            return Ok(WorkDir::Override(path));
        }
    }

    if request.strict {
        return Err(AppError::Directory(format!(
            "no working directory configured for project '{}' ({}) and strict directory policy is enabled",
            request.project_name, request.project_id
        )));
    }

    if let Some(root) = root {
        let under_root = root.join(request.project_name);
        if !request.project_name.is_empty() && under_root.is_dir() {
            return Ok(WorkDir::ProjectUnderRoot(under_root));
        }
        if root.is_dir() {
            return Ok(WorkDir::Root(root));
        }
        warn!(root = %root.display(), "workspace root does not exist, inheriting working directory");
    }

    debug!(project = request.project_id, "no directory resolved, inheriting working directory");
    Ok(WorkDir::Inherit)
}

/// Expand a leading `~` to the user's home directory.
///
/// Paths without `~`, and `~user` forms, are returned unchanged; so is
/// everything when no home directory can be determined.
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Make a relative path absolute against `root`, or the current directory
/// when there is no root.
fn anchor(path: PathBuf, root: Option<&Path>) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match root {
        Some(root) => root.join(path),
        None => std::env::current_dir().map_or(path.clone(), |cwd| cwd.join(&path)),
    }
}

/// Accept an existing directory; otherwise fail (strict) or fall through.
fn check(candidate: &Path, label: &str, request: &DirectoryRequest<'_>) -> Result<Option<PathBuf>> {
    if candidate.is_dir() {
        return Ok(Some(candidate.to_path_buf()));
    }

    if request.strict {
        return Err(AppError::Directory(format!(
            "{label} {} for project '{}' does not exist",
            candidate.display(),
            request.project_id
        )));
    }

    warn!(
        project = request.project_id,
        path = %candidate.display(),
        "{label} does not exist, falling through"
    );
    Ok(None)
}
