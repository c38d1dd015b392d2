//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Line protocol or request/response failure on a worker stream.
    Rpc(String),
    /// The worker process could not be started.
    Spawn(String),
    /// No matching response arrived before the request deadline.
    Timeout(String),
    /// The worker process exited while a request was outstanding.
    WorkerExited(String),
    /// Working directory could not be resolved under strict policy.
    Directory(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Automated action against a session this supervisor does not own.
    Unauthorized(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error means the peer never answered in time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::WorkerExited(msg) => write!(f, "worker exited: {msg}"),
            Self::Directory(msg) => write!(f, "directory: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Rpc(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
