//! Session orchestration.
//!
//! Covers the session registry and restart cooldowns, working-directory
//! resolution, and the supervisor facade that ties them to RPC clients.

pub mod registry;
pub mod supervisor;
pub mod workdir;
