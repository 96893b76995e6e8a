//! Listener lifecycle.
//!
//! Every port of every endpoint gets its own listening socket and accept
//! loop. Accepted connections are dispatched onto their own task and
//! tracked in the [`PendingRegistry`] until they finish; a background task
//! sweeps finished sessions out of it.
//!
//! Shutdown is cooperative: [`ListenerManager::stop`] raises the shared
//! signal, then waits (bounded) for the accept loops and for pending
//! sessions to unwind on their own.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info_span, Instrument};

use super::connection::ConnectionRecord;
use super::registry::PendingRegistry;
use super::session::SessionHandler;
use crate::config::{Config, EndpointConfig, ProxyType};
use crate::error::{ConfigError, ProxyError, Result};
use crate::logger::ProxyLogger;
use crate::recorder::ConnectionRecorder;
use crate::shutdown::{Shutdown, ShutdownSignal};

/// How often finished sessions are pruned from the registry.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for each of the two shutdown waits.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Owns the listeners, the pending registry and the shutdown signal.
pub struct ListenerManager {
    /// Validated configuration the listeners were built from.
    config: Config,
    /// State shared with every accept loop and session task.
    dispatcher: Arc<Dispatcher>,
    /// Raised once by [`stop`](Self::stop) or on drop.
    shutdown: Shutdown,
    /// One accept loop per bound port.
    listeners: Vec<JoinHandle<()>>,
    /// Periodic registry sweep; `Some` once started.
    sweeper: Option<JoinHandle<()>>,
    /// Addresses actually bound, in bind order.
    local_addrs: Vec<SocketAddr>,
    /// Bound on each of the two waits in [`stop`](Self::stop).
    drain_timeout: Duration,
}

impl ListenerManager {
    /// Build a manager for a configuration. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(
        config: Config,
        logger: Arc<dyn ProxyLogger>,
        recorder: Arc<dyn ConnectionRecorder>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let dispatcher = Dispatcher {
            handler: SessionHandler::new(&config.settings, Arc::clone(&logger)),
            logger,
            recorder,
            registry: Arc::new(PendingRegistry::new()),
            history: RwLock::new(Vec::new()),
            api_key: config.settings.api_key.clone(),
        };

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
            shutdown: Shutdown::new(),
            listeners: Vec::new(),
            sweeper: None,
            local_addrs: Vec::new(),
            drain_timeout: DRAIN_TIMEOUT,
        })
    }

    /// Override the bound applied to each shutdown wait.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Bind one listener per configured port and start accepting.
    ///
    /// Every socket is bound before any accept loop starts. A port that
    /// cannot be bound is logged and skipped; the other ports still
    /// listen. Fails only if no port at all could be bound. Calling
    /// `start` again on a running manager does nothing.
    pub async fn start(&mut self) -> Result<()> {
        if self.sweeper.is_some() {
            return Ok(());
        }

        let mut bound = Vec::with_capacity(self.config.listener_count());
        let mut last_failure = None;
        for (index, endpoint) in self.config.endpoints.iter().enumerate() {
            let ip = endpoint.bind_ip().ok_or_else(|| ConfigError::InvalidAddress {
                index,
                address: endpoint.listening_address.clone(),
            })?;
            let endpoint = Arc::new(endpoint.clone());

            for port in endpoint.listening_port_range.ports() {
                let addr = SocketAddr::new(ip, port);
                match TcpListener::bind(addr).await {
                    Ok(listener) => bound.push((listener, addr, Arc::clone(&endpoint))),
                    Err(source) => {
                        self.dispatcher.logger.error(
                            &format!("Failed to bind port {} on {}", port, ip),
                            None,
                            Some(&source),
                        );
                        last_failure = Some(ProxyError::Bind { addr, source });
                    }
                }
            }
        }

        if bound.is_empty() {
            if let Some(err) = last_failure {
                return Err(err);
            }
        } else if last_failure.is_some() {
            self.dispatcher.logger.warn(
                &format!(
                    "Listening on {} of {} ports",
                    bound.len(),
                    self.config.listener_count()
                ),
                None,
            );
        }

        for (listener, addr, endpoint) in bound {
            let local_addr = listener.local_addr().unwrap_or(addr);
            self.dispatcher.logger.info(&describe(&endpoint, local_addr), None);

            self.local_addrs.push(local_addr);
            self.listeners.push(tokio::spawn(accept_loop(
                listener,
                local_addr,
                endpoint,
                Arc::clone(&self.dispatcher),
                self.shutdown.signal(),
            )));
        }

        self.sweeper = Some(tokio::spawn(sweep_loop(
            Arc::clone(&self.dispatcher),
            self.shutdown.signal(),
        )));

        Ok(())
    }

    /// Signal shutdown and wait for listeners and sessions to unwind.
    ///
    /// Each wait is bounded by the drain timeout. Overruns are logged, not
    /// raised. Returns `true` if everything finished in time. Safe to call
    /// more than once.
    pub async fn stop(&mut self) -> bool {
        self.shutdown.trigger();
        let logger = &self.dispatcher.logger;

        let listeners = std::mem::take(&mut self.listeners);
        let listeners_stopped =
            match tokio::time::timeout(self.drain_timeout, join_all(listeners)).await {
                Ok(results) => {
                    for result in results {
                        if let Err(e) = result {
                            logger.error("Listener task failed", None, Some(&e));
                        }
                    }
                    true
                }
                Err(_) => {
                    logger.warn(
                        &format!("Some listeners did not stop within {:?}", self.drain_timeout),
                        None,
                    );
                    false
                }
            };

        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }

        let sessions_finished = tokio::time::timeout(self.drain_timeout, self.dispatcher.drained())
            .await
            .is_ok();

        // The sweep task is gone; prune once more so the counts are accurate.
        self.dispatcher.sweep();

        if !sessions_finished {
            logger.warn(
                &format!(
                    "Some sessions did not finish, {} still pending",
                    self.pending_connections_count()
                ),
                None,
            );
        }

        listeners_stopped && sessions_finished
    }

    /// Sessions currently in flight.
    pub fn pending_connections_count(&self) -> usize {
        self.dispatcher.registry.len()
    }

    /// Connections accepted since the manager was created.
    pub fn total_connections_count(&self) -> usize {
        self.dispatcher.history_len()
    }

    pub fn active_connections(&self) -> Vec<Arc<ConnectionRecord>> {
        self.dispatcher.registry.snapshot()
    }

    /// Every accepted connection, oldest first.
    pub fn statistics(&self) -> Vec<Arc<ConnectionRecord>> {
        self.dispatcher.history_snapshot()
    }

    /// Addresses of the bound listeners, in bind order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// State shared by every accept loop and the sweep task.
struct Dispatcher {
    /// Runs the honeypot or forward path for one connection.
    handler: SessionHandler,
    /// Operational log shared with the session handler.
    logger: Arc<dyn ProxyLogger>,
    /// Notified once per connection after its session ends.
    recorder: Arc<dyn ConnectionRecorder>,
    /// Sessions whose task has not been swept yet.
    registry: Arc<PendingRegistry>,
    /// Every accepted connection, oldest first. Never pruned.
    history: RwLock<Vec<Arc<ConnectionRecord>>>,
    /// Passed through to the recorder untouched.
    api_key: Option<String>,
}

impl Dispatcher {
    /// Spawn the session task for an accepted connection and track it.
    fn dispatch(
        self: &Arc<Self>,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        endpoint: &EndpointConfig,
        shutdown: &ShutdownSignal,
    ) {
        let record = Arc::new(ConnectionRecord::new(endpoint, local_addr, peer_addr));
        let session = record.session_id();
        self.push_history(Arc::clone(&record));

        let this = Arc::clone(self);
        let task_record = Arc::clone(&record);
        let signal = shutdown.clone();
        let task = tokio::spawn(
            async move {
                this.handler
                    .handle(stream, Arc::clone(&task_record), signal)
                    .await;

                let recorder = Arc::clone(&this.recorder);
                let api_key = this.api_key.clone();
                tokio::spawn(async move {
                    recorder.record(task_record, api_key).await;
                });
            }
            .instrument(info_span!("session", session_id = %session, peer = %peer_addr)),
        );

        if let Err(e) = self.registry.add(record, task) {
            self.logger
                .error("Failed to track session", Some(session), Some(&e));
        }
    }

    fn sweep(&self) {
        if let Err(e) = self.registry.sweep() {
            self.logger.error("Registry sweep failed", None, Some(&e));
        }
    }

    /// Resolves once the registry is empty.
    async fn drained(&self) {
        loop {
            self.sweep();
            if self.registry.is_empty() {
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    fn push_history(&self, record: Arc<ConnectionRecord>) {
        match self.history.write() {
            Ok(mut history) => history.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    fn history_len(&self) -> usize {
        match self.history.read() {
            Ok(history) => history.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn history_snapshot(&self) -> Vec<Arc<ConnectionRecord>> {
        match self.history.read() {
            Ok(history) => history.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Logs the final line for a port however its accept loop ends.
struct StoppedListening {
    port: u16,
    logger: Arc<dyn ProxyLogger>,
}

impl Drop for StoppedListening {
    fn drop(&mut self) {
        self.logger
            .info(&format!("Stopped listening on port {}", self.port), None);
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    endpoint: Arc<EndpointConfig>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: ShutdownSignal,
) {
    let port = local_addr.port();
    let _stopped = StoppedListening {
        port,
        logger: Arc::clone(&dispatcher.logger),
    };

    loop {
        let accepted = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                dispatcher
                    .logger
                    .debug(&format!("Accept loop on port {} cancelled", port), None);
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                dispatcher.dispatch(stream, local_addr, peer_addr, &endpoint, &shutdown);
            }
            Err(e) if is_transient(&e) => {
                dispatcher.logger.warn(
                    &format!("Accept on port {} interrupted: {}", port, e),
                    None,
                );
            }
            Err(e) => {
                dispatcher.logger.error(
                    &format!("Accept failed on port {}", port),
                    None,
                    Some(&e),
                );
                break;
            }
        }
    }

    drop(listener);
}

async fn sweep_loop(dispatcher: Arc<Dispatcher>, mut shutdown: ShutdownSignal) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = interval.tick() => dispatcher.sweep(),
        }
    }

    dispatcher.logger.debug("Sweep task stopped", None);
}

/// Accept errors that concern one handshake rather than the listener.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn describe(endpoint: &EndpointConfig, local_addr: SocketAddr) -> String {
    match (endpoint.proxy_type, endpoint.target()) {
        (ProxyType::Forward, Some(target)) => format!(
            "Listening on {} in {} mode, forwarding to {}",
            local_addr, endpoint.proxy_type, target
        ),
        _ => format!("Listening on {} in {} mode", local_addr, endpoint.proxy_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortRange, ProxySettings};
    use crate::logger::{LogLevel, MemoryLogger};
    use crate::recorder::NoopRecorder;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn manager(endpoints: Vec<EndpointConfig>) -> (ListenerManager, Arc<MemoryLogger>) {
        let logger = Arc::new(MemoryLogger::new());
        let config = Config::new(endpoints, ProxySettings::default());
        let manager = ListenerManager::new(config, logger.clone(), Arc::new(NoopRecorder)).unwrap();
        (manager, logger)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = Config::new(vec![], ProxySettings::default());
        let result = ListenerManager::new(
            config,
            Arc::new(MemoryLogger::new()),
            Arc::new(NoopRecorder),
        );
        assert!(matches!(result, Err(ConfigError::NoEndpoints)));
    }

    #[test]
    fn test_describe_names_target_for_forward() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let forward = EndpointConfig::forward(PortRange::single(9000), "10.0.0.5", 80);
        assert_eq!(
            describe(&forward, addr),
            "Listening on 0.0.0.0:9000 in Forward mode, forwarding to 10.0.0.5:80"
        );

        let honeypot = EndpointConfig::honeypot(PortRange::single(9000));
        assert_eq!(describe(&honeypot, addr), "Listening on 0.0.0.0:9000 in HoneyPot mode");
    }

    #[tokio::test]
    async fn test_stop_without_start_is_immediate() {
        let port = free_port();
        let (mut manager, _logger) =
            manager(vec![EndpointConfig::honeypot(PortRange::single(port)).with_address("127.0.0.1")]);

        let started = std::time::Instant::now();
        assert!(manager.stop().await);
        assert!(manager.stop().await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.pending_connections_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_skips_only_that_port() {
        let free = free_port();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();

        let (mut manager, logger) = manager(vec![
            EndpointConfig::honeypot(PortRange::single(taken)).with_address("127.0.0.1"),
            EndpointConfig::honeypot(PortRange::single(free)).with_address("127.0.0.1"),
        ]);

        manager.start().await.unwrap();
        let ports: Vec<u16> = manager.local_addrs().iter().map(|a| a.port()).collect();
        assert_eq!(ports, vec![free]);
        assert!(logger.contains(LogLevel::Error, &format!("Failed to bind port {}", taken)));
        assert!(logger.contains(LogLevel::Warn, "Listening on 1 of 2 ports"));

        // The sibling listener is up and accepting.
        tokio::net::TcpStream::connect(("127.0.0.1", free)).await.unwrap();

        assert!(manager.stop().await);
    }

    #[tokio::test]
    async fn test_start_fails_when_no_port_binds() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();

        let (mut manager, logger) =
            manager(vec![EndpointConfig::honeypot(PortRange::single(taken)).with_address("127.0.0.1")]);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { addr, .. } if addr.port() == taken));
        assert!(manager.local_addrs().is_empty());
        assert!(logger.contains(LogLevel::Error, "Failed to bind"));
    }

    #[tokio::test]
    async fn test_stop_reports_sessions_that_outlive_drain_timeout() {
        let port = free_port();
        let endpoint = EndpointConfig::honeypot(PortRange::single(port)).with_address("127.0.0.1");
        let (manager, logger) = manager(vec![endpoint.clone()]);
        let mut manager = manager.with_drain_timeout(Duration::from_millis(200));
        manager.start().await.unwrap();

        // A session task that ignores the shutdown signal.
        let record = Arc::new(ConnectionRecord::new(
            &endpoint,
            manager.local_addrs()[0],
            "198.51.100.7:40000".parse().unwrap(),
        ));
        let stuck = tokio::spawn(std::future::pending::<()>());
        manager.dispatcher.registry.add(record, stuck).unwrap();

        let started = std::time::Instant::now();
        assert!(!manager.stop().await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.pending_connections_count(), 1);
        assert!(logger.contains(LogLevel::Warn, "Some sessions did not finish, 1 still pending"));
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loops() {
        let port = free_port();
        let (mut manager, logger) =
            manager(vec![EndpointConfig::honeypot(PortRange::single(port)).with_address("127.0.0.1")]);

        manager.start().await.unwrap();
        assert_eq!(manager.local_addrs().len(), 1);
        assert!(logger.contains(LogLevel::Info, "HoneyPot mode"));

        assert!(manager.stop().await);
        assert!(manager.is_stopping());
        assert!(logger.contains(LogLevel::Debug, &format!("Accept loop on port {} cancelled", port)));
        assert!(logger.contains(LogLevel::Info, &format!("Stopped listening on port {}", port)));

        // The socket was closed with the loop.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
