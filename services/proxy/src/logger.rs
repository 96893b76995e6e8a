//! Logger collaborator.
//!
//! The engine reports through [`ProxyLogger`] so the destination of its
//! output can be swapped without touching the proxy code. Every session
//! scoped line carries the session id for correlation.
//!
//! [`TracingLogger`] is what the binary uses; [`MemoryLogger`] keeps lines
//! in memory for embedding and tests.

use std::error::Error;
use std::sync::{Mutex, MutexGuard};

use snare_id::SessionId;
use tracing::field::display;
use tracing::{debug, error, info, warn};

use crate::proxy::Direction;

/// Target used for raw traffic captures.
pub const TRAFFIC_TARGET: &str = "snare::traffic";

/// Leveled log sink plus a separate sink for captured payloads.
pub trait ProxyLogger: Send + Sync + 'static {
    fn info(&self, message: &str, session: Option<SessionId>);

    fn warn(&self, message: &str, session: Option<SessionId>);

    fn debug(&self, message: &str, session: Option<SessionId>);

    fn error(&self, message: &str, session: Option<SessionId>, cause: Option<&(dyn Error + 'static)>);

    /// One coalesced capture of raw traffic, decoded as text.
    fn request(&self, payload: &str, bytes: usize, direction: Direction, session: SessionId);
}

/// [`ProxyLogger`] backed by `tracing` events.
///
/// Raw captures go to the [`TRAFFIC_TARGET`] target so a subscriber can
/// route them separately from operational lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl ProxyLogger for TracingLogger {
    fn info(&self, message: &str, session: Option<SessionId>) {
        info!(session_id = session.map(display), "{}", message);
    }

    fn warn(&self, message: &str, session: Option<SessionId>) {
        warn!(session_id = session.map(display), "{}", message);
    }

    fn debug(&self, message: &str, session: Option<SessionId>) {
        debug!(session_id = session.map(display), "{}", message);
    }

    fn error(&self, message: &str, session: Option<SessionId>, cause: Option<&(dyn Error + 'static)>) {
        error!(
            session_id = session.map(display),
            error = cause.map(display),
            "{}",
            message
        );
    }

    fn request(&self, payload: &str, bytes: usize, direction: Direction, session: SessionId) {
        info!(
            target: TRAFFIC_TARGET,
            session_id = %session,
            bytes,
            direction = %direction,
            payload = %payload,
            "Traffic captured"
        );
    }
}

/// Severity of a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A leveled line kept by [`MemoryLogger`].
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub session: Option<SessionId>,
    pub cause: Option<String>,
}

/// A raw capture kept by [`MemoryLogger`].
#[derive(Debug, Clone)]
pub struct TrafficEntry {
    pub payload: String,
    pub bytes: usize,
    pub direction: Direction,
    pub session: SessionId,
}

/// [`ProxyLogger`] that keeps everything in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
    traffic: Mutex<Vec<TrafficEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).clone()
    }

    pub fn traffic(&self) -> Vec<TrafficEntry> {
        lock(&self.traffic).clone()
    }

    /// Lines for one session, in the order they were logged.
    pub fn session_entries(&self, session: SessionId) -> Vec<LogEntry> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.session == Some(session))
            .cloned()
            .collect()
    }

    /// True if a line at `level` contains `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        lock(&self.entries)
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }

    fn push(&self, level: LogLevel, message: &str, session: Option<SessionId>, cause: Option<String>) {
        lock(&self.entries).push(LogEntry {
            level,
            message: message.to_string(),
            session,
            cause,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProxyLogger for MemoryLogger {
    fn info(&self, message: &str, session: Option<SessionId>) {
        self.push(LogLevel::Info, message, session, None);
    }

    fn warn(&self, message: &str, session: Option<SessionId>) {
        self.push(LogLevel::Warn, message, session, None);
    }

    fn debug(&self, message: &str, session: Option<SessionId>) {
        self.push(LogLevel::Debug, message, session, None);
    }

    fn error(&self, message: &str, session: Option<SessionId>, cause: Option<&(dyn Error + 'static)>) {
        self.push(LogLevel::Error, message, session, cause.map(|c| c.to_string()));
    }

    fn request(&self, payload: &str, bytes: usize, direction: Direction, session: SessionId) {
        lock(&self.traffic).push(TrafficEntry {
            payload: payload.to_string(),
            bytes,
            direction,
            session,
        });
    }
}
