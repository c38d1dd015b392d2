//! Worker stream pump tasks.
//!
//! [`run_reader`] drives a [`FramedRead`] over the worker's stdout with
//! [`RpcCodec`] and hands every decoded value to the client's inbound router.
//! [`drain_stderr`] forwards diagnostic output to the log so a chatty worker
//! never blocks on a full pipe.
//!
//! Neither task reports process death; that is the exit supervisor's job.
//! A reader that hits EOF simply stops.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::rpc::client::ClientShared;
use crate::rpc::codec::RpcCodec;

/// Read NDJSON values from `stdout` until EOF or an I/O error.
pub async fn run_reader<R>(stdout: R, shared: Arc<ClientShared>)
where
    R: AsyncRead + Unpin + Send,
{
    let session = shared.session().to_owned();
    let mut framed = FramedRead::new(stdout, RpcCodec::new());

    while let Some(item) = framed.next().await {
        match item {
            Ok(value) => shared.route(value).await,
            Err(err) => {
                warn!(session, error = %err, "rpc reader: stream error, stopping");
                return;
            }
        }
    }

    debug!(
        session,
        dropped = framed.decoder().dropped(),
        "rpc reader: EOF detected"
    );
}

/// Forward each stderr line to `DEBUG` logs until EOF.
///
/// Lines are read as raw bytes and logged lossily, so non-UTF-8 output never
/// stops the drain.
pub async fn drain_stderr<R>(session: String, stderr: R)
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                debug!(session, line = line.trim_end(), "worker stderr");
            }
            Err(err) => {
                debug!(session, %err, "worker stderr closed with error");
                break;
            }
        }
    }
}
