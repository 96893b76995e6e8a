//! One-direction byte relay with coalesced traffic logging.
//!
//! Each chunk is written to the output as soon as it is read. The same
//! bytes are staged and handed to the traffic log only when the input goes
//! quiet, so a request split across many TCP segments shows up as a single
//! capture.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snare_id::SessionId;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::timed_read::{read_available, read_with_timeout};
use crate::config::ProxySettings;
use crate::error::{ProxyError, Result};
use crate::logger::ProxyLogger;
use crate::shutdown::ShutdownSignal;

/// Which way bytes flow through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to proxy (and on to the target).
    Inbound,
    /// Target back to the client.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Relay parameters taken from [`ProxySettings`].
#[derive(Clone)]
pub struct RelayEngine {
    logger: Arc<dyn ProxyLogger>,
    buffer_size: usize,
    receive_timeout: Duration,
    send_timeout: Duration,
    log_outbound: bool,
}

impl RelayEngine {
    pub fn new(settings: &ProxySettings, logger: Arc<dyn ProxyLogger>) -> Self {
        Self {
            logger,
            buffer_size: settings.buffer_size.max(1),
            receive_timeout: settings.socket_timeout(),
            send_timeout: settings.socket_timeout(),
            log_outbound: settings.logs_outbound_traffic(),
        }
    }

    /// Inbound traffic is always logged; outbound only at trace level.
    pub fn logs(&self, direction: Direction) -> bool {
        match direction {
            Direction::Inbound => true,
            Direction::Outbound => self.log_outbound,
        }
    }

    /// Copy `input` to `output` until EOF, error or shutdown.
    ///
    /// However the copy ends, the write side of `output` is shut down so the
    /// peer sees the half-close. Returns the number of bytes forwarded.
    pub async fn relay<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        session: SessionId,
        direction: Direction,
        mut shutdown: ShutdownSignal,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut staging = Vec::new();
        let result = self
            .pump(input, output, &mut staging, session, direction, &mut shutdown)
            .await;

        // Whatever was forwarded before a failure still gets logged.
        self.flush(&mut staging, session, direction);

        let closed = output.shutdown().await;
        let forwarded = result?;
        closed?;
        Ok(forwarded)
    }

    async fn pump<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        staging: &mut Vec<u8>,
        session: SessionId,
        direction: Direction,
        shutdown: &mut ShutdownSignal,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let log = self.logs(direction);
        let mut buf = vec![0u8; self.buffer_size];
        let mut ready: Option<usize> = None;
        let mut forwarded = 0u64;

        loop {
            // A chunk already taken off the input is forwarded before
            // cancellation is honoured.
            let n = match ready.take() {
                Some(n) => n,
                None => {
                    if shutdown.is_cancelled() {
                        return Err(ProxyError::Cancelled);
                    }
                    read_with_timeout(input, &mut buf, self.receive_timeout, shutdown).await?
                }
            };
            if n == 0 {
                return Ok(forwarded);
            }

            if log {
                staging.extend_from_slice(&buf[..n]);
            }
            self.write(output, &buf[..n], shutdown).await?;
            forwarded += n as u64;

            match read_available(input, &mut buf) {
                Some(Ok(n)) => ready = Some(n),
                Some(Err(e)) => return Err(e.into()),
                None => self.flush(staging, session, direction),
            }
        }
    }

    /// Write one chunk, bounded by the send timeout.
    ///
    /// The write is polled before the shutdown signal, so a peer that is
    /// keeping up still receives the chunk. A peer that stops reading is
    /// abandoned as soon as shutdown fires.
    async fn write<W>(&self, output: &mut W, chunk: &[u8], shutdown: &mut ShutdownSignal) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        tokio::select! {
            biased;

            written = tokio::time::timeout(self.send_timeout, output.write_all(chunk)) => match written {
                Ok(result) => Ok(result?),
                Err(_) => Err(ProxyError::SendTimeout(self.send_timeout)),
            },
            _ = shutdown.cancelled() => Err(ProxyError::Cancelled),
        }
    }

    fn flush(&self, staging: &mut Vec<u8>, session: SessionId, direction: Direction) {
        if staging.is_empty() {
            return;
        }
        {
            let payload = String::from_utf8_lossy(staging);
            self.logger
                .request(&payload, staging.len(), direction, session);
        }
        staging.clear();
    }
}
