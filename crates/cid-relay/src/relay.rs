// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay core implementation.

use crate::config::{ConfigError, RelayConfig};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

pub mod frame;
pub mod queue;
pub mod registry;
pub mod rewrite;
pub mod session;
pub mod stats;
pub mod upstream;

use queue::{ForwardQueue, ForwardUnit};
use registry::{DeviceEvent, DeviceRegistry, DeviceSnapshot, GlobalEvent};
use rewrite::RewriteRules;
use session::PanelSession;
use stats::{RelayStats, StatsSnapshot};
use upstream::UpstreamClient;

/// Grace period for in-flight tasks after the shutdown signal before
/// they are torn down forcefully.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Store-and-forward relay between alarm panels and the monitoring host.
#[derive(Clone)]
pub struct RelayServer {
    config: Arc<RelayConfig>,
    rules: Arc<RewriteRules>,
    queue: Arc<ForwardQueue>,
    queue_rx: Arc<Mutex<Option<mpsc::Receiver<ForwardUnit>>>>,
    registry: Arc<DeviceRegistry>,
    stats: Arc<RelayStats>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    listen_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl RelayServer {
    /// Create a new relay from configuration.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config
            .validate()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let rules = RewriteRules::try_from(&config.rules)
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let (queue, queue_rx) = ForwardQueue::new(config.queue_size);

        Ok(Self {
            config: Arc::new(config),
            rules: Arc::new(rules),
            queue: Arc::new(queue),
            queue_rx: Arc::new(Mutex::new(Some(queue_rx))),
            registry: Arc::new(DeviceRegistry::new()),
            stats: Arc::new(RelayStats::new()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            listen_addr: Arc::new(Mutex::new(None)),
        })
    }

    /// Run the relay: bind the panel listener, start the egress loop and
    /// the inactive-device sweep, and accept sessions until shutdown.
    pub async fn run(&self) -> Result<(), RelayError> {
        use tokio::net::TcpListener;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let queue_rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or(RelayError::AlreadyRunning)?;

        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Bind(e.to_string()))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::Bind(e.to_string()))?;
        *self.listen_addr.lock() = Some(local_addr);
        self.stats.reset();

        info!("relay listening on {}", local_addr);

        let mut tasks = tokio::task::JoinSet::new();

        // Egress loop: the queue's sole consumer.
        let client = UpstreamClient::new(&self.config, self.stats.clone());
        let egress_shutdown = self.shutdown.clone();
        tasks.spawn(async move {
            client.run(queue_rx, egress_shutdown).await;
        });

        // Inactive-device sweep.
        let registry = self.registry.clone();
        let threshold = self.config.inactivity_threshold();
        let sweep_interval = self.config.sweep_interval();
        let sweep_shutdown = self.shutdown.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_interval) => {
                        let removed = registry.sweep_inactive(threshold);
                        if !removed.is_empty() {
                            info!(count = removed.len(), "swept inactive devices");
                        }
                    }
                    _ = sweep_shutdown.notified() => {
                        break;
                    }
                }
            }
        });

        // Accept panel sessions.
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            info!(peer = %peer, "accepted panel connection");
                            let session = PanelSession::new(
                                stream,
                                peer,
                                self.rules.clone(),
                                self.queue.clone(),
                                self.registry.clone(),
                                self.stats.clone(),
                            );
                            let session_shutdown = self.shutdown.clone();
                            tasks.spawn(session.run(session_shutdown));
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown signal received, closing listener");
                    break;
                }
            }
        }

        // Stop feeding the egress loop; it drains what is queued.
        self.queue.close();

        // Observers see end-of-stream and fall back to snapshots.
        self.registry.close_observers();

        // Honor the grace period, then tear down whatever is left.
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace elapsed, aborting remaining tasks");
            tasks.abort_all();
        }

        self.running.store(false, Ordering::SeqCst);
        info!("relay stopped");
        Ok(())
    }

    /// Signal the relay to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Check if the relay is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the panel listener is bound to, once running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// One-shot snapshot of the relay counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot of all devices, histories omitted, sorted by id.
    pub fn snapshot_devices(&self) -> Vec<DeviceSnapshot> {
        self.registry.snapshot_devices()
    }

    /// Snapshot of the global event ring, newest first.
    pub fn snapshot_global_events(&self) -> Vec<GlobalEvent> {
        self.registry.snapshot_global_events()
    }

    /// Copy of a device's bounded history, oldest first.
    pub fn device_history(&self, device_id: u32) -> Vec<DeviceEvent> {
        self.registry.device_history(device_id)
    }

    /// Take the global device-updates stream (first caller only).
    pub fn device_updates(&self) -> Option<mpsc::Receiver<DeviceSnapshot>> {
        self.registry.device_updates()
    }

    /// Take the global event-updates stream (first caller only).
    pub fn event_updates(&self) -> Option<mpsc::Receiver<GlobalEvent>> {
        self.registry.event_updates()
    }

    /// Open a per-device event stream for a detail view.
    pub fn open_device_stream(&self, device_id: u32) -> mpsc::Receiver<DeviceEvent> {
        self.registry.open_device_stream(device_id)
    }

    /// Close a per-device event stream.
    pub fn close_device_stream(&self, device_id: u32) {
        self.registry.close_device_stream(device_id)
    }
}

/// Relay error types.
#[derive(Debug)]
pub enum RelayError {
    Config(String),
    Bind(String),
    AlreadyRunning,
    Io(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "Configuration error: {}", s),
            Self::Bind(s) => write!(f, "Bind error: {}", s),
            Self::AlreadyRunning => write!(f, "Relay already running"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = RelayConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            RelayServer::new(config),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_relay_error_display() {
        assert!(RelayError::Config("bad".into()).to_string().contains("bad"));
        assert!(RelayError::AlreadyRunning.to_string().contains("running"));
        let err: RelayError = std::io::Error::other("boom").into();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let config = RelayConfig {
            port: 0,
            ..Default::default()
        };
        let server = RelayServer::new(config).unwrap();
        assert!(!server.is_running());

        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        // Wait until the listener is up.
        while server.listen_addr().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.is_running());
        assert!(matches!(
            server.run().await,
            Err(RelayError::AlreadyRunning)
        ));

        server.shutdown();
        runner.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
