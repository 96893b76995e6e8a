//! Per-connection record.
//!
//! Identity and addressing are fixed at accept time. Only the reputation
//! fields change afterwards, written by the connection recorder once the
//! session has finished.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snare_id::SessionId;

use crate::config::{host_port, EndpointConfig, ProxyType};

/// Post-hoc enrichment supplied by the reputation collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reputation {
    pub is_blacklisted: bool,
    pub country_name: Option<String>,
}

/// One accepted TCP connection.
///
/// Equality and hashing use the session id only.
#[derive(Debug)]
pub struct ConnectionRecord {
    session_id: SessionId,
    connection_time: DateTime<Utc>,
    proxy_type: ProxyType,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    target_host: Option<String>,
    target_port: Option<u16>,
    reputation: RwLock<Reputation>,
}

impl ConnectionRecord {
    /// Record a connection accepted on `local_addr` for `endpoint`.
    pub fn new(endpoint: &EndpointConfig, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self::with_id(SessionId::new(), endpoint, local_addr, remote_addr)
    }

    pub fn with_id(
        session_id: SessionId,
        endpoint: &EndpointConfig,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            session_id,
            connection_time: Utc::now(),
            proxy_type: endpoint.proxy_type,
            local_addr,
            remote_addr,
            target_host: endpoint.target_host.clone(),
            target_port: endpoint.target_port,
            reputation: RwLock::new(Reputation::default()),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connection_time(&self) -> DateTime<Utc> {
        self.connection_time
    }

    pub fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn target_host(&self) -> Option<&str> {
        self.target_host.as_deref()
    }

    pub fn target_port(&self) -> Option<u16> {
        self.target_port
    }

    /// `host:port` of the forward target, if any.
    pub fn target(&self) -> Option<String> {
        match (&self.target_host, self.target_port) {
            (Some(host), Some(port)) => Some(host_port(host, port)),
            _ => None,
        }
    }

    pub fn reputation(&self) -> Reputation {
        match self.reputation.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_reputation(&self, reputation: Reputation) {
        match self.reputation.write() {
            Ok(mut guard) => *guard = reputation,
            Err(poisoned) => *poisoned.into_inner() = reputation,
        }
    }

    /// Point-in-time copy for reporting.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let reputation = self.reputation();
        ConnectionSnapshot {
            session_id: self.session_id,
            connection_time: self.connection_time,
            proxy_type: self.proxy_type,
            local_address: self.local_addr,
            remote_address: self.remote_addr,
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            is_blacklisted: reputation.is_blacklisted,
            country_name: reputation.country_name,
        }
    }
}

impl PartialEq for ConnectionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

impl Eq for ConnectionRecord {}

impl Hash for ConnectionRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session_id.hash(state);
    }
}

/// Serializable view of a [`ConnectionRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub session_id: SessionId,
    pub connection_time: DateTime<Utc>,
    pub proxy_type: ProxyType,
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub is_blacklisted: bool,
    pub country_name: Option<String>,
}
