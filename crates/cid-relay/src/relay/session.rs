// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-panel session handling.
//!
//! One task per accepted connection. Frames are handled strictly in
//! arrival order, one at a time; the loop never reads ahead of a
//! pending reply, so the panel's view of ACK/NACK ordering is
//! unambiguous.

use crate::relay::frame::{is_heartbeat, FrameSplitter, ACK, NACK};
use crate::relay::queue::{EnqueueError, ForwardQueue};
use crate::relay::registry::DeviceRegistry;
use crate::relay::rewrite::{device_id, rewrite, RewriteRules};
use crate::relay::stats::RelayStats;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Idle deadline on panel reads. An idle session is kept alive with a
/// NACK per elapsed period.
pub const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a session waits for the delivery status of an enqueued
/// frame before NACKing on its own.
pub const REPLY_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk size.
const READ_CHUNK: usize = 1024;

/// A connected panel session.
pub struct PanelSession {
    stream: TcpStream,
    peer: SocketAddr,
    rules: Arc<RewriteRules>,
    queue: Arc<ForwardQueue>,
    registry: Arc<DeviceRegistry>,
    stats: Arc<RelayStats>,
    splitter: FrameSplitter,
}

impl PanelSession {
    /// Wrap an accepted connection.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        rules: Arc<RewriteRules>,
        queue: Arc<ForwardQueue>,
        registry: Arc<DeviceRegistry>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            stream,
            peer,
            rules,
            queue,
            registry,
            stats,
            splitter: FrameSplitter::new(),
        }
    }

    /// Run the session until peer close, an unrecoverable write error,
    /// or shutdown.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        debug!(peer = %self.peer, "session started");

        loop {
            let mut chunk = [0u8; READ_CHUNK];

            let read = tokio::select! {
                _ = shutdown.notified() => {
                    info!(peer = %self.peer, "closing session on shutdown");
                    return;
                }
                read = timeout(SESSION_READ_TIMEOUT, self.stream.read(&mut chunk)) => read,
            };

            let n = match read {
                Err(_) => {
                    // Idle panel: one NACK keeps the session alive.
                    warn!(peer = %self.peer, "read timeout");
                    if self.respond(NACK).await.is_err() {
                        return;
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(peer = %self.peer, "read error: {}", e);
                    return;
                }
                Ok(Ok(0)) => {
                    info!(peer = %self.peer, "connection closed by panel");
                    return;
                }
                Ok(Ok(n)) => n,
            };

            self.splitter.extend(&chunk[..n]);

            while let Some(frame) = self.splitter.next_frame() {
                if self.handle_frame(&frame).await.is_err() {
                    warn!(peer = %self.peer, "response write failed, closing session");
                    return;
                }
            }

            if let Some(dropped) = self.splitter.discard_if_oversized() {
                warn!(
                    peer = %self.peer,
                    bytes = dropped,
                    "discarded oversized accumulator without sentinel"
                );
            }
        }
    }

    /// Classify and dispose of one decoded frame, answering the panel
    /// with exactly one ACK or NACK byte.
    async fn handle_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        if frame.is_empty() {
            warn!(peer = %self.peer, "empty frame");
            return self.respond(NACK).await;
        }

        if is_heartbeat(frame) {
            debug!(peer = %self.peer, "heartbeat");
            return self.respond(ACK).await;
        }

        if !self.rules.is_valid(frame) {
            warn!(
                peer = %self.peer,
                frame = %String::from_utf8_lossy(frame),
                "invalid frame"
            );
            return self.respond(NACK).await;
        }

        let rewritten = match rewrite(frame, &self.rules) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %self.peer, "rewrite failed: {}", e);
                return self.respond(NACK).await;
            }
        };

        let reply = match self.queue.try_enqueue(rewritten.clone()) {
            Ok(reply) => reply,
            Err(EnqueueError::Full) => {
                warn!(peer = %self.peer, "forward queue full, rejecting frame");
                self.stats.record_rejected();
                return self.respond(NACK).await;
            }
            Err(EnqueueError::Closed) => {
                debug!(peer = %self.peer, "forward queue closed, rejecting frame");
                return self.respond(NACK).await;
            }
        };

        // Identity comes from the rewritten payload: the registry is
        // keyed by the post-shift account.
        if let Some(id) = device_id(&rewritten) {
            self.registry.record_event(id, rewritten);
        }

        match timeout(REPLY_WAIT_TIMEOUT, reply).await {
            Ok(Ok(status)) => {
                info!(
                    peer = %self.peer,
                    status = if status { "ACK" } else { "NACK" },
                    frame = %String::from_utf8_lossy(frame),
                    "frame relayed"
                );
                self.respond(if status { ACK } else { NACK }).await
            }
            Ok(Err(_)) => {
                // The egress side dropped the unit without resolving it.
                warn!(peer = %self.peer, "delivery status never arrived");
                self.respond(NACK).await
            }
            Err(_) => {
                warn!(peer = %self.peer, "timed out waiting for delivery status");
                self.stats.record_rejected();
                self.respond(NACK).await
            }
        }
    }

    /// Emit the one-byte response to the panel.
    async fn respond(&mut self, byte: u8) -> std::io::Result<()> {
        self.stream.write_all(&[byte]).await
    }
}
