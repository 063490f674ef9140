// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Egress connection manager.
//!
//! Owns the single long-lived connection to the monitoring host and the
//! sole consumer loop over the forward queue. Strictly one frame in
//! flight: write the payload, read the one-byte reply, resolve the
//! unit's reply handle, repeat. Any I/O fault tears the connection down
//! and the manager dials again with capped exponential backoff.

use crate::config::RelayConfig;
use crate::relay::frame::ACK;
use crate::relay::queue::ForwardUnit;
use crate::relay::stats::RelayStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Deadline for dialing the upstream host.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for writing one payload.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for reading the one-byte reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream transport error types.
#[derive(Debug)]
pub enum UpstreamError {
    Io(String),
    WriteTimeout,
    ReplyTimeout,
    /// The peer returned a zero-length read: connection closed or no
    /// longer speaking the protocol.
    EmptyReply,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::WriteTimeout => write!(f, "write deadline exceeded"),
            Self::ReplyTimeout => write!(f, "reply deadline exceeded"),
            Self::EmptyReply => write!(f, "empty reply from upstream"),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Why the connected loop ended.
enum ServeEnd {
    Shutdown,
    QueueClosed,
    Fault,
}

/// Egress connection manager state machine:
/// `Disconnected -> Connecting -> Connected`, back to `Disconnected` on
/// any fault, `Stopping` on the shutdown signal.
pub struct UpstreamClient {
    host: String,
    port: u16,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    stats: Arc<RelayStats>,
}

impl UpstreamClient {
    /// Create a client from configuration.
    pub fn new(config: &RelayConfig, stats: Arc<RelayStats>) -> Self {
        Self {
            host: config.upstream_host.clone(),
            port: config.upstream_port,
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
            stats,
        }
    }

    /// Run the reconnect loop until shutdown or queue close.
    pub async fn run(self, mut queue_rx: mpsc::Receiver<ForwardUnit>, shutdown: Arc<Notify>) {
        let mut delay = self.reconnect_initial;

        loop {
            let dial = timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((self.host.as_str(), self.port)),
            );

            let dialed = tokio::select! {
                _ = shutdown.notified() => {
                    info!("upstream client stopping");
                    return;
                }
                dialed = dial => dialed,
            };

            match dialed {
                Ok(Ok(stream)) => {
                    info!(host = %self.host, port = self.port, "connected to upstream");
                    self.stats.set_connected(true);
                    delay = self.reconnect_initial;

                    let end = self.serve(stream, &mut queue_rx, &shutdown).await;

                    self.stats.set_connected(false);
                    match end {
                        ServeEnd::Shutdown => {
                            info!("upstream client stopping");
                            return;
                        }
                        ServeEnd::QueueClosed => {
                            info!("forward queue closed, upstream client exiting");
                            return;
                        }
                        ServeEnd::Fault => {
                            info!("upstream connection lost, reconnecting");
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.stats.record_reconnect();
                    warn!(
                        host = %self.host,
                        port = self.port,
                        delay_secs = delay.as_secs(),
                        "upstream dial failed: {}", e
                    );
                    tokio::select! {
                        _ = shutdown.notified() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.reconnect_max);
                }
                Err(_) => {
                    self.stats.record_reconnect();
                    warn!(
                        host = %self.host,
                        port = self.port,
                        delay_secs = delay.as_secs(),
                        "upstream connect deadline exceeded"
                    );
                    tokio::select! {
                        _ = shutdown.notified() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.reconnect_max);
                }
            }
        }
    }

    /// Connected state: relay units one at a time until a fault,
    /// shutdown, or queue end-of-stream.
    async fn serve(
        &self,
        mut stream: TcpStream,
        queue_rx: &mut mpsc::Receiver<ForwardUnit>,
        shutdown: &Notify,
    ) -> ServeEnd {
        loop {
            let unit = tokio::select! {
                _ = shutdown.notified() => return ServeEnd::Shutdown,
                unit = queue_rx.recv() => unit,
            };

            let unit = match unit {
                Some(unit) => unit,
                None => return ServeEnd::QueueClosed,
            };

            match self.exchange(&mut stream, &unit.payload).await {
                Ok(status) => {
                    if status {
                        self.stats.record_accepted();
                        debug!("upstream acknowledged frame");
                    } else {
                        self.stats.record_rejected();
                        debug!("upstream refused frame");
                    }
                    // The waiter may have timed out and gone away.
                    let _ = unit.reply.send(status);
                }
                Err(e) => {
                    self.stats.record_rejected();
                    warn!("upstream exchange failed: {}", e);
                    let _ = unit.reply.send(false);
                    return ServeEnd::Fault;
                }
            }
        }
    }

    /// Write one payload and read the one-byte reply, both under
    /// deadlines. `Ok(true)` iff the first reply byte is ACK.
    async fn exchange(
        &self,
        stream: &mut TcpStream,
        payload: &[u8],
    ) -> Result<bool, UpstreamError> {
        timeout(WRITE_TIMEOUT, stream.write_all(payload))
            .await
            .map_err(|_| UpstreamError::WriteTimeout)?
            .map_err(|e| UpstreamError::Io(e.to_string()))?;

        let mut reply = [0u8; 1024];
        let n = timeout(REPLY_TIMEOUT, stream.read(&mut reply))
            .await
            .map_err(|_| UpstreamError::ReplyTimeout)?
            .map_err(|e| UpstreamError::Io(e.to_string()))?;

        if n == 0 {
            return Err(UpstreamError::EmptyReply);
        }
        Ok(reply[0] == ACK)
    }
}
