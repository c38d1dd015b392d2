//! Worker control protocol.
//!
//! Each supervised worker is a child process speaking newline-delimited JSON
//! over its stdio. This module owns everything below the session layer:
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing that
//!   yields parsed JSON values and drops malformed lines.
//! - `message`: typed outbound commands and inbound classification.
//! - `process`: child spawning, exit supervision and signal escalation.
//! - `reader`: stdout/stderr pump tasks.
//! - `client`: [`RpcClient`](client::RpcClient), the request/response surface
//!   with id correlation and per-call deadlines.

pub mod client;
pub mod codec;
pub mod message;
pub mod process;
pub mod reader;
