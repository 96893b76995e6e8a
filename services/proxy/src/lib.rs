//! Multi-port TCP reverse proxy and honeypot engine.
//!
//! Each configured endpoint either captures inbound bytes without
//! forwarding them (honeypot) or relays them to an upstream target
//! (forward), mirroring observed traffic to a [`ProxyLogger`].

pub mod config;
pub mod error;
pub mod logger;
pub mod proxy;
pub mod recorder;
pub mod shutdown;

pub use config::{Config, EndpointConfig, PortRange, ProxySettings, ProxyType};
pub use error::{ConfigError, ProxyError, Result};
pub use logger::{MemoryLogger, ProxyLogger, TracingLogger};
pub use proxy::{
    ConnectionRecord, ConnectionSnapshot, Direction, ListenerManager, PendingRegistry, RelayEngine,
    Reputation, SessionHandler,
};
pub use recorder::{ConnectionRecorder, NoopRecorder, TracingRecorder};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use snare_id::SessionId;
