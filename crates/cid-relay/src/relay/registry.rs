// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device registry and event bus.
//!
//! The registry is the single source of truth for panel state: a map
//! from device identity (the rewritten account number) to its bounded
//! event history, plus a fixed-capacity ring of the most recent events
//! across all devices. Observers receive lossy notifications over
//! bounded channels and reconcile via snapshots when they need
//! completeness.
//!
//! Lock discipline: mutate under the lock, copy out what must be
//! published, release, then publish. Channel sends never happen under a
//! lock and never block.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bounded per-device history length.
pub const HISTORY_CAPACITY: usize = 100;

/// Fixed capacity of the global event ring.
pub const GLOBAL_RING_CAPACITY: usize = 500;

/// Buffer depth of every observer channel.
const OBSERVER_CHANNEL_CAPACITY: usize = 100;

/// One event recorded against a device.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// Wall-clock time the relay recorded the event.
    pub time: DateTime<Utc>,

    /// Rewritten payload, sentinel included.
    pub payload: Vec<u8>,
}

/// One event in the global ring.
#[derive(Debug, Clone)]
pub struct GlobalEvent {
    pub time: DateTime<Utc>,
    pub device_id: u32,
    pub payload: Vec<u8>,
}

/// Point-in-time device view with the history omitted for fast scans.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub id: u32,
    pub last_event_time: DateTime<Utc>,
    pub last_event: Vec<u8>,
}

/// Registry-internal device state.
#[derive(Debug)]
struct Device {
    id: u32,
    last_event_time: DateTime<Utc>,
    last_event: Vec<u8>,
    history: VecDeque<DeviceEvent>,
    last_seen: Instant,
}

impl Device {
    fn new(id: u32) -> Self {
        Self {
            id,
            last_event_time: Utc::now(),
            last_event: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            last_seen: Instant::now(),
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            last_event_time: self.last_event_time,
            last_event: self.last_event.clone(),
        }
    }
}

/// Flat circular buffer of the most recent global events.
#[derive(Debug)]
struct EventRing {
    slots: Vec<Option<GlobalEvent>>,
    head: usize,
}

impl EventRing {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
        }
    }

    /// Advance the head and store, overwriting the oldest entry.
    fn push(&mut self, event: GlobalEvent) {
        self.slots[self.head] = Some(event);
        self.head = (self.head + 1) % self.slots.len();
    }

    /// Occupied entries, newest first.
    fn snapshot(&self) -> Vec<GlobalEvent> {
        let cap = self.slots.len();
        let mut events = Vec::with_capacity(cap);
        for offset in 1..=cap {
            let idx = (self.head + cap - offset) % cap;
            match &self.slots[idx] {
                Some(ev) => events.push(ev.clone()),
                None => break,
            }
        }
        events
    }
}

/// Registry state behind the single readers-writer lock.
#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<u32, Device>,
    streams: HashMap<u32, mpsc::Sender<DeviceEvent>>,
}

/// Global observer senders, dropped together on shutdown so receivers
/// observe end-of-stream.
#[derive(Debug)]
struct ObserverSenders {
    device_updates: mpsc::Sender<DeviceSnapshot>,
    event_updates: mpsc::Sender<GlobalEvent>,
}

/// In-memory device registry and observer fan-out.
#[derive(Debug)]
pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    ring: Mutex<EventRing>,
    observers: Mutex<Option<ObserverSenders>>,
    device_updates_rx: Mutex<Option<mpsc::Receiver<DeviceSnapshot>>>,
    event_updates_rx: Mutex<Option<mpsc::Receiver<GlobalEvent>>>,
}

impl DeviceRegistry {
    /// Create an empty registry with its observer channels.
    pub fn new() -> Self {
        let (device_tx, device_rx) = mpsc::channel(OBSERVER_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(OBSERVER_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            ring: Mutex::new(EventRing::new(GLOBAL_RING_CAPACITY)),
            observers: Mutex::new(Some(ObserverSenders {
                device_updates: device_tx,
                event_updates: event_tx,
            })),
            device_updates_rx: Mutex::new(Some(device_rx)),
            event_updates_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Record a forwarded event against a device, creating the device on
    /// first sight, then notify observers.
    ///
    /// Called from ingress after a successful enqueue, with the identity
    /// parsed from the rewritten payload.
    pub fn record_event(&self, device_id: u32, payload: Vec<u8>) {
        let now = Utc::now();

        let (snapshot, stream) = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            let device = inner
                .devices
                .entry(device_id)
                .or_insert_with(|| Device::new(device_id));

            // Wall clock steps backwards must not violate per-device
            // monotonicity of last_event_time.
            let time = now.max(device.last_event_time);

            if device.history.len() == HISTORY_CAPACITY {
                device.history.pop_front();
            }
            device.history.push_back(DeviceEvent {
                time,
                payload: payload.clone(),
            });
            device.last_event_time = time;
            device.last_event = payload.clone();
            device.last_seen = Instant::now();

            (device.snapshot(), inner.streams.get(&device_id).cloned())
        };

        {
            let mut ring = self.ring.lock();
            ring.push(GlobalEvent {
                time: snapshot.last_event_time,
                device_id,
                payload: payload.clone(),
            });
        }

        let senders = {
            let observers = self.observers.lock();
            observers
                .as_ref()
                .map(|o| (o.device_updates.clone(), o.event_updates.clone()))
        };

        let global = GlobalEvent {
            time: snapshot.last_event_time,
            device_id,
            payload,
        };

        if let Some((device_tx, event_tx)) = senders {
            if device_tx.try_send(snapshot).is_err() {
                warn!(device_id, "device updates channel full, dropping update");
            }
            if event_tx.try_send(global.clone()).is_err() {
                warn!(device_id, "event updates channel full, dropping event");
            }
        }

        if let Some(stream) = stream {
            let event = DeviceEvent {
                time: global.time,
                payload: global.payload,
            };
            if stream.try_send(event).is_err() {
                warn!(device_id, "device stream full or closed, dropping event");
            }
        }
    }

    /// Snapshot of all devices, histories omitted, sorted by id.
    pub fn snapshot_devices(&self) -> Vec<DeviceSnapshot> {
        let inner = self.inner.read();
        let mut devices: Vec<DeviceSnapshot> =
            inner.devices.values().map(Device::snapshot).collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    /// Snapshot of the global event ring, newest first.
    pub fn snapshot_global_events(&self) -> Vec<GlobalEvent> {
        self.ring.lock().snapshot()
    }

    /// Copy of a device's bounded history, oldest first.
    pub fn device_history(&self, device_id: u32) -> Vec<DeviceEvent> {
        self.inner
            .read()
            .devices
            .get(&device_id)
            .map(|d| d.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of devices currently tracked.
    pub fn device_count(&self) -> usize {
        self.inner.read().devices.len()
    }

    /// Open a per-device event stream for a detail view.
    ///
    /// Replaces any previously opened stream for the device; the old
    /// receiver observes end-of-stream.
    pub fn open_device_stream(&self, device_id: u32) -> mpsc::Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel(OBSERVER_CHANNEL_CAPACITY);
        self.inner.write().streams.insert(device_id, tx);
        rx
    }

    /// Close a per-device event stream.
    pub fn close_device_stream(&self, device_id: u32) {
        self.inner.write().streams.remove(&device_id);
    }

    /// Take the global device-updates receiver. Yields the channel's
    /// sole receiver on the first call, `None` afterwards.
    pub fn device_updates(&self) -> Option<mpsc::Receiver<DeviceSnapshot>> {
        self.device_updates_rx.lock().take()
    }

    /// Take the global event-updates receiver. Yields the channel's
    /// sole receiver on the first call, `None` afterwards.
    pub fn event_updates(&self) -> Option<mpsc::Receiver<GlobalEvent>> {
        self.event_updates_rx.lock().take()
    }

    /// Close every observer channel: the global update streams and all
    /// per-device streams. Their receivers observe end-of-stream.
    /// Idempotent; subsequent updates still land in the registry state.
    pub fn close_observers(&self) {
        self.observers.lock().take();
        self.inner.write().streams.clear();
    }

    /// Remove devices idle longer than `threshold`, closing their
    /// per-device streams. Returns the removed ids.
    pub fn sweep_inactive(&self, threshold: Duration) -> Vec<u32> {
        let mut inner = self.inner.write();
        let expired: Vec<u32> = inner
            .devices
            .iter()
            .filter(|(_, d)| d.last_seen.elapsed() > threshold)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            inner.devices.remove(id);
            inner.streams.remove(id);
            debug!(device_id = *id, "swept inactive device");
        }
        expired
    }

    /// Rewind a device's activity clock. Test hook for the sweep.
    #[cfg(test)]
    fn backdate_device(&self, device_id: u32, by: Duration) {
        if let Some(device) = self.inner.write().devices.get_mut(&device_id) {
            device.last_seen = Instant::now() - by;
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(account: &str) -> Vec<u8> {
        format!("5010 18{}E60216331\x14", account).into_bytes()
    }

    #[test]
    fn test_device_created_on_first_event() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.device_count(), 0);

        registry.record_event(4200, payload("4200"));

        assert_eq!(registry.device_count(), 1);
        let devices = registry.snapshot_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, 4200);
        assert_eq!(devices[0].last_event, payload("4200"));
    }

    #[test]
    fn test_history_bounded_drop_oldest() {
        let registry = DeviceRegistry::new();
        for i in 0..(HISTORY_CAPACITY + 10) {
            let mut p = payload("4200");
            p.push(i as u8);
            registry.record_event(4200, p);
        }

        let history = registry.device_history(4200);
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // The 10 oldest events were discarded.
        assert_eq!(*history[0].payload.last().unwrap(), 10);
        assert_eq!(
            *history.last().unwrap().payload.last().unwrap(),
            (HISTORY_CAPACITY + 9) as u8
        );
    }

    #[test]
    fn test_last_event_time_monotonic() {
        let registry = DeviceRegistry::new();
        registry.record_event(4200, payload("4200"));
        let first = registry.snapshot_devices()[0].last_event_time;
        registry.record_event(4200, payload("4200"));
        let second = registry.snapshot_devices()[0].last_event_time;
        assert!(second >= first);
    }

    #[test]
    fn test_snapshot_devices_sorted_by_id() {
        let registry = DeviceRegistry::new();
        registry.record_event(4300, payload("4300"));
        registry.record_event(1999, payload("1999"));
        registry.record_event(4200, payload("4200"));

        let ids: Vec<u32> = registry.snapshot_devices().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1999, 4200, 4300]);
    }

    #[test]
    fn test_global_ring_newest_first_and_bounded() {
        let registry = DeviceRegistry::new();
        for i in 0..(GLOBAL_RING_CAPACITY + 20) {
            let mut p = payload("4200");
            p.push((i % 251) as u8);
            registry.record_event(4200, p);
        }

        let events = registry.snapshot_global_events();
        assert_eq!(events.len(), GLOBAL_RING_CAPACITY);
        // Newest entry first.
        assert_eq!(
            *events[0].payload.last().unwrap(),
            ((GLOBAL_RING_CAPACITY + 19) % 251) as u8
        );
    }

    #[test]
    fn test_history_for_unknown_device_is_empty() {
        let registry = DeviceRegistry::new();
        assert!(registry.device_history(1).is_empty());
    }

    #[tokio::test]
    async fn test_observer_channels_receive_updates() {
        let registry = DeviceRegistry::new();
        let mut device_rx = registry.device_updates().unwrap();
        let mut event_rx = registry.event_updates().unwrap();

        // The receivers can be taken only once.
        assert!(registry.device_updates().is_none());
        assert!(registry.event_updates().is_none());

        registry.record_event(4200, payload("4200"));

        let update = device_rx.recv().await.unwrap();
        assert_eq!(update.id, 4200);
        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.device_id, 4200);
    }

    #[tokio::test]
    async fn test_full_observer_channel_drops_update() {
        let registry = DeviceRegistry::new();
        let _device_rx = registry.device_updates().unwrap();
        let _event_rx = registry.event_updates().unwrap();

        // Nothing reads the channels; overflow must not block or fail.
        for _ in 0..(OBSERVER_CHANNEL_CAPACITY + 50) {
            registry.record_event(4200, payload("4200"));
        }
        assert_eq!(registry.device_count(), 1);
        assert_eq!(
            registry.device_history(4200).len(),
            HISTORY_CAPACITY.min(OBSERVER_CHANNEL_CAPACITY + 50)
        );
    }

    #[tokio::test]
    async fn test_device_stream_open_close() {
        let registry = DeviceRegistry::new();
        let mut stream = registry.open_device_stream(4200);

        registry.record_event(4200, payload("4200"));
        let event = stream.recv().await.unwrap();
        assert_eq!(event.payload, payload("4200"));

        registry.close_device_stream(4200);
        // Sender dropped: the stream observes end-of-stream.
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_inactive_and_closes_stream() {
        let registry = DeviceRegistry::new();
        registry.record_event(4200, payload("4200"));
        registry.record_event(4300, payload("4300"));
        let mut stream = registry.open_device_stream(4200);

        registry.backdate_device(4200, Duration::from_secs(3700));

        let removed = registry.sweep_inactive(Duration::from_secs(3600));
        assert_eq!(removed, vec![4200]);
        assert_eq!(registry.device_count(), 1);
        assert!(registry.device_history(4200).is_empty());
        // The per-device stream was closed by the sweep.
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_observers_ends_streams() {
        let registry = DeviceRegistry::new();
        let mut device_rx = registry.device_updates().unwrap();
        let mut event_rx = registry.event_updates().unwrap();
        let mut stream = registry.open_device_stream(4200);

        registry.close_observers();
        registry.close_observers();

        assert!(device_rx.recv().await.is_none());
        assert!(event_rx.recv().await.is_none());
        assert!(stream.recv().await.is_none());

        // State keeps accumulating after observers are gone.
        registry.record_event(4200, payload("4200"));
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn test_sweep_keeps_active_devices() {
        let registry = DeviceRegistry::new();
        registry.record_event(4200, payload("4200"));

        let removed = registry.sweep_inactive(Duration::from_secs(3600));
        assert!(removed.is_empty());
        assert_eq!(registry.device_count(), 1);
    }
}
