//! Connection history collaborator.
//!
//! The manager hands every finished connection to a [`ConnectionRecorder`]
//! on a detached task. Whatever the recorder does (persist, look up IP
//! reputation, enrich the record) never delays the session or shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::proxy::ConnectionRecord;

/// Target used for completed-connection summaries.
pub const HISTORY_TARGET: &str = "snare::history";

#[async_trait]
pub trait ConnectionRecorder: Send + Sync + 'static {
    /// Called once per connection, after its session has finished.
    async fn record(&self, record: Arc<ConnectionRecord>, api_key: Option<String>);
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait]
impl ConnectionRecorder for NoopRecorder {
    async fn record(&self, _record: Arc<ConnectionRecord>, _api_key: Option<String>) {}
}

/// Emits one `tracing` event per finished connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

#[async_trait]
impl ConnectionRecorder for TracingRecorder {
    async fn record(&self, record: Arc<ConnectionRecord>, _api_key: Option<String>) {
        let reputation = record.reputation();
        info!(
            target: HISTORY_TARGET,
            session_id = %record.session_id(),
            proxy_type = %record.proxy_type(),
            remote_addr = %record.remote_addr(),
            local_addr = %record.local_addr(),
            upstream = record.target().as_deref(),
            connected_at = %record.connection_time().to_rfc3339(),
            blacklisted = reputation.is_blacklisted,
            country = reputation.country_name.as_deref(),
            "Connection completed"
        );
    }
}
