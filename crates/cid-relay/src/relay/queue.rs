// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded forward queue coupling ingress sessions to the egress loop.
//!
//! Each queued unit pairs the rewritten payload with a single-shot reply
//! handle. The egress loop resolves the handle with the upstream's
//! delivery status; if the egress side goes away the dropped sender
//! resolves the waiter with a receive error, so no waiter is ever left
//! parked.

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

/// One message in flight from a panel session to the egress loop.
#[derive(Debug)]
pub struct ForwardUnit {
    /// Rewritten payload, sentinel included, ready to send as-is.
    pub payload: Vec<u8>,

    /// Single-shot delivery-status carrier back to the waiting session.
    pub reply: oneshot::Sender<bool>,
}

/// Enqueue error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the caller must NACK the panel.
    Full,
    /// The queue has been closed (relay shutting down).
    Closed,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "forward queue full"),
            Self::Closed => write!(f, "forward queue closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Producer side of the bounded forward queue.
///
/// Enqueue is non-blocking; overflow is reported, never absorbed. The
/// single receiver is handed to the egress loop at construction.
#[derive(Debug)]
pub struct ForwardQueue {
    tx: Mutex<Option<mpsc::Sender<ForwardUnit>>>,
}

impl ForwardQueue {
    /// Create a queue with the given capacity, returning the producer
    /// handle and the egress loop's receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ForwardUnit>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Enqueue a rewritten payload without blocking.
    ///
    /// On success returns the reply handle the caller waits on; the
    /// egress loop resolves it with the upstream's status.
    pub fn try_enqueue(&self, payload: Vec<u8>) -> Result<oneshot::Receiver<bool>, EnqueueError> {
        let tx = match &*self.tx.lock() {
            Some(tx) => tx.clone(),
            None => return Err(EnqueueError::Closed),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        match tx.try_send(ForwardUnit {
            payload,
            reply: reply_tx,
        }) {
            Ok(()) => Ok(reply_rx),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Close the queue. Idempotent; the consumer drains already-queued
    /// units and then observes end-of-stream.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}
