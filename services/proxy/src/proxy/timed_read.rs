//! Reads raced against a timeout and the shutdown signal.
//!
//! tokio streams have no per-read timeout, so each read is a `select!`
//! between the read itself, a timer, and cancellation. The honeypot capture
//! and the relay both read through here and share one failure model for
//! stalled peers.

use std::io;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};
use crate::shutdown::ShutdownSignal;

/// Read into `buf`, failing with [`ProxyError::Timeout`] if nothing arrives
/// within `timeout` and with [`ProxyError::Cancelled`] on shutdown.
///
/// Returns `Ok(0)` when the peer closed its side.
pub async fn read_with_timeout<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
    shutdown: &mut ShutdownSignal,
) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::select! {
        biased;

        _ = shutdown.cancelled() => Err(ProxyError::Cancelled),
        result = reader.read(buf) => Ok(result?),
        _ = tokio::time::sleep(timeout) => Err(ProxyError::Timeout(timeout)),
    }
}

/// Read only if data (or EOF) is already available.
///
/// `None` means the stream is quiescent: a read would have to wait. Reads
/// are cancel safe, so nothing is lost when the check comes back empty.
///
/// The read runs outside tokio's cooperative budget. Otherwise a task that
/// has done enough I/O in one poll sees `Pending` from a stream that still
/// holds data, and a single burst is reported as several.
pub fn read_available<R>(reader: &mut R, buf: &mut [u8]) -> Option<io::Result<usize>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::task::unconstrained(reader.read(buf)).now_or_never()
}
