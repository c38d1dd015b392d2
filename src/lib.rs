#![forbid(unsafe_code)]

//! Per-project supervisor for long-running worker processes.
//!
//! Workers speak a newline-delimited JSON request/response protocol over
//! stdio. The crate spawns one worker per project, keeps it alive under a
//! cooldown-gated restart policy, and hands it new work only when it is idle.

pub mod config;
pub mod config_watcher;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod rpc;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
