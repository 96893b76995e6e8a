//! TCP proxy engine.
//!
//! This module provides:
//! - One listener and accept loop per configured port
//! - Honeypot capture and forward relay per accepted connection
//! - Coalesced raw-traffic logging in the relay
//! - The pending-session registry and its background sweep
//!
//! ## Architecture
//!
//! ```text
//! ListenerManager -> accept loop (per port) -> SessionHandler -> RelayEngine (forward only)
//!        |                                          |
//!   sweep task  <----------  PendingRegistry  <-----+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use snare_proxy::{Config, ListenerManager, NoopRecorder, TracingLogger};
//!
//! let config = Config::from_env()?;
//! let mut manager = ListenerManager::new(config, Arc::new(TracingLogger), Arc::new(NoopRecorder))?;
//! manager.start().await?;
//! tokio::signal::ctrl_c().await?;
//! manager.stop().await;
//! ```

mod connection;
mod manager;
mod registry;
mod relay;
mod session;
mod timed_read;

pub use connection::{ConnectionRecord, ConnectionSnapshot, Reputation};
pub use manager::{ListenerManager, DRAIN_TIMEOUT, SWEEP_INTERVAL};
pub use registry::{PendingRegistry, PendingSession};
pub use relay::{Direction, RelayEngine};
pub use session::SessionHandler;
pub use timed_read::{read_available, read_with_timeout};
