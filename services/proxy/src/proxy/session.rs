//! Per-connection handling.
//!
//! A session is classified by the endpoint's proxy type:
//! - HoneyPot: drain whatever the peer has sent, close, log the capture.
//!   Nothing is ever written upstream.
//! - Forward: connect to the target and relay both directions until both
//!   finish.
//!
//! Failures are contained here and reported through the logger at a level
//! matching their kind. Nothing propagates to the accept loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use snare_id::SessionId;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::connection::ConnectionRecord;
use super::relay::{Direction, RelayEngine};
use super::timed_read::{read_available, read_with_timeout};
use crate::config::{ProxySettings, ProxyType};
use crate::error::{ProxyError, Result};
use crate::logger::ProxyLogger;
use crate::shutdown::ShutdownSignal;

/// Handles accepted connections for every endpoint.
#[derive(Clone)]
pub struct SessionHandler {
    logger: Arc<dyn ProxyLogger>,
    relay: RelayEngine,
    buffer_size: usize,
    socket_timeout: Duration,
}

impl SessionHandler {
    pub fn new(settings: &ProxySettings, logger: Arc<dyn ProxyLogger>) -> Self {
        Self {
            relay: RelayEngine::new(settings, Arc::clone(&logger)),
            logger,
            buffer_size: settings.buffer_size.max(1),
            socket_timeout: settings.socket_timeout(),
        }
    }

    /// Run one session to completion.
    ///
    /// Connections accepted after shutdown are dropped untouched.
    pub async fn handle(
        &self,
        mut client: TcpStream,
        record: Arc<ConnectionRecord>,
        mut shutdown: ShutdownSignal,
    ) {
        if shutdown.is_cancelled() {
            return;
        }

        let session = record.session_id();
        self.logger.info(
            &format!(
                "Connection received from {} on {} ({})",
                record.remote_addr(),
                record.local_addr(),
                record.proxy_type()
            ),
            Some(session),
        );

        let result = match record.proxy_type() {
            ProxyType::HoneyPot => self
                .capture(&mut client, session, &mut shutdown)
                .await
                .map(|_| ()),
            ProxyType::Forward => self.forward(client, &record, shutdown).await,
        };

        if let Err(e) = result {
            self.report("Session ended", &e, session);
        }
    }

    /// Drain what the peer has sent so far, then close the connection.
    ///
    /// Waits up to the receive timeout for the first bytes, then keeps
    /// reading only while more data is already available. Returns the
    /// number of bytes captured.
    pub async fn capture<S>(
        &self,
        stream: &mut S,
        session: SessionId,
        shutdown: &mut ShutdownSignal,
    ) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut captured = Vec::new();
        let drained = self.drain(stream, &mut captured, shutdown).await;

        // Closing is best effort; the peer may already be gone.
        let _ = stream.shutdown().await;

        if captured.is_empty() {
            if drained.is_ok() {
                self.logger.warn("No data received", Some(session));
            }
        } else {
            self.logger.info(
                &format!("Connection dropped, {} bytes captured", captured.len()),
                Some(session),
            );
            let payload = String::from_utf8_lossy(&captured);
            self.logger
                .request(&payload, captured.len(), Direction::Inbound, session);
        }

        drained.map(|_| captured.len())
    }

    async fn drain<S>(
        &self,
        stream: &mut S,
        captured: &mut Vec<u8>,
        shutdown: &mut ShutdownSignal,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut n = read_with_timeout(stream, &mut buf, self.socket_timeout, shutdown).await?;

        while n > 0 {
            captured.extend_from_slice(&buf[..n]);
            n = match read_available(stream, &mut buf) {
                Some(result) => result?,
                None => break,
            };
        }

        Ok(())
    }

    async fn forward(
        &self,
        client: TcpStream,
        record: &ConnectionRecord,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        let session = record.session_id();
        let target = record.target().ok_or_else(|| ProxyError::Connect {
            target: "<unset>".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "forward target not configured"),
        })?;

        let connect = tokio::time::timeout(self.socket_timeout, TcpStream::connect(target.as_str()));
        let connected = tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Err(ProxyError::Cancelled),
            result = connect => result,
        };
        let upstream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProxyError::Connect { target, source }),
            Err(_) => {
                return Err(ProxyError::Connect {
                    target,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        self.logger
            .debug(&format!("Connected to upstream {}", target), Some(session));

        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        let (inbound, outbound) = tokio::join!(
            self.relay.relay(
                &mut client_read,
                &mut upstream_write,
                session,
                Direction::Inbound,
                shutdown.clone(),
            ),
            self.relay.relay(
                &mut upstream_read,
                &mut client_write,
                session,
                Direction::Outbound,
                shutdown,
            ),
        );

        for (direction, result) in [(Direction::Inbound, inbound), (Direction::Outbound, outbound)] {
            match result {
                Ok(bytes) => self.logger.debug(
                    &format!("{} relay finished, {} bytes forwarded", direction, bytes),
                    Some(session),
                ),
                Err(e) => self.report(&format!("{} relay ended", direction), &e, session),
            }
        }

        Ok(())
    }

    fn report(&self, context: &str, err: &ProxyError, session: SessionId) {
        let message = format!("{}: {}", context, err);
        if err.is_cancelled() {
            self.logger.debug(&message, Some(session));
        } else if err.is_benign() || err.is_timeout() {
            self.logger.warn(&message, Some(session));
        } else {
            self.logger.error(&message, Some(session), Some(err));
        }
    }
}
