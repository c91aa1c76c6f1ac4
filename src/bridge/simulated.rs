//! In-process BLE and MIDI port simulator
//!
//! Stands in for the platform BLE stack and output port so the supervisor
//! can be driven end to end without hardware. The test side scripts
//! advertisements and link outcomes, then plays the peripheral by pushing
//! notification packets into the active session.

use crate::bridge::sink::{MidiPortOpener, MidiSink};
use crate::bridge::transport::{
    subscription, BleLink, BleTransport, LinkSender, Subscription, ADVERTISEMENT_QUEUE_DEPTH,
};
use crate::domain::codec::{encode, TimedMessage, DEFAULT_MAX_PACKET_LEN};
use crate::domain::error::{BridgeError, BridgeResult, SinkError};
use crate::domain::models::DeviceDescriptor;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

/// Outcome of a connect or subscribe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// Never completes; only a timeout or a stop ends the attempt.
    Hang,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct SimState {
    advertisements: Mutex<Vec<DeviceDescriptor>>,
    scan_tx: Mutex<Option<mpsc::Sender<DeviceDescriptor>>>,
    connect: Mutex<Option<Behavior>>,
    subscribe: Mutex<Option<Behavior>>,
    sessions: Mutex<Vec<LinkSender>>,
    session_ready: Notify,
    scans: AtomicUsize,
    connect_attempts: AtomicUsize,
    active_links: AtomicUsize,
}

/// Simulated BLE central.
#[derive(Clone, Default)]
pub struct SimTransport {
    state: Arc<SimState>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device that every subsequent scan will report, in call order.
    pub fn advertise(&self, device: DeviceDescriptor) {
        lock(&self.state.advertisements).push(device);
    }

    pub fn set_connect(&self, behavior: Behavior) {
        *lock(&self.state.connect) = Some(behavior);
    }

    pub fn set_subscribe(&self, behavior: Behavior) {
        *lock(&self.state.subscribe) = Some(behavior);
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state.scan_tx).is_some()
    }

    pub fn scan_count(&self) -> usize {
        self.state.scans.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Links connected and not yet released.
    pub fn active_links(&self) -> usize {
        self.state.active_links.load(Ordering::SeqCst)
    }

    /// Wait for the `n`th successful subscription (1-based) and return the
    /// peripheral side of it.
    pub async fn session(&self, n: usize) -> SimPeripheral {
        loop {
            let notified = self.state.session_ready.notified();
            if let Some(link) = lock(&self.state.sessions).get(n.saturating_sub(1)) {
                return SimPeripheral { link: link.clone() };
            }
            notified.await;
        }
    }
}

#[async_trait]
impl BleTransport for SimTransport {
    type Link = SimLink;

    async fn start_scan(&self) -> BridgeResult<mpsc::Receiver<DeviceDescriptor>> {
        self.state.scans.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(ADVERTISEMENT_QUEUE_DEPTH);
        for device in lock(&self.state.advertisements).iter() {
            let _ = tx.try_send(device.clone());
        }
        *lock(&self.state.scan_tx) = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) {
        lock(&self.state.scan_tx).take();
    }

    async fn connect(&self, _device: &DeviceDescriptor) -> BridgeResult<SimLink> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = lock(&self.state.connect)
            .clone()
            .unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => {
                self.state.active_links.fetch_add(1, Ordering::SeqCst);
                Ok(SimLink {
                    state: self.state.clone(),
                    released: false,
                })
            }
            Behavior::Fail(reason) => Err(BridgeError::ConnectFailure(reason)),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Simulated physical link. Dropping it releases the link.
pub struct SimLink {
    state: Arc<SimState>,
    released: bool,
}

impl SimLink {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.state.active_links.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BleLink for SimLink {
    async fn subscribe(&mut self) -> BridgeResult<Subscription> {
        let behavior = lock(&self.state.subscribe)
            .clone()
            .unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => {
                let (sender, subscription) = subscription();
                lock(&self.state.sessions).push(sender);
                self.state.session_ready.notify_waiters();
                Ok(subscription)
            }
            Behavior::Fail(reason) => Err(BridgeError::SubscribeFailure(reason)),
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) {
        self.release();
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Peripheral side of one simulated session.
#[derive(Clone)]
pub struct SimPeripheral {
    link: LinkSender,
}

impl SimPeripheral {
    /// Deliver one GATT notification. Returns false if the session is gone.
    pub async fn notify(&self, packet: &[u8]) -> bool {
        self.link.notify_wait(packet.to_vec()).await
    }

    /// Deliver a notification the way a platform callback does: without
    /// waiting, dropping it when the queue is full.
    pub fn try_notify(&self, packet: &[u8]) -> bool {
        self.link.notify(packet.to_vec())
    }

    /// Encode `messages` the way a peripheral would and deliver every
    /// resulting packet. Returns false if the session is gone.
    pub async fn send_messages(&self, messages: &[TimedMessage], compact: bool) -> bool {
        for packet in encode(messages, DEFAULT_MAX_PACKET_LEN, compact) {
            if !self.notify(&packet).await {
                return false;
            }
        }
        true
    }

    /// Simulate the peripheral going away.
    pub fn drop_link(&self, reason: &str) {
        self.link.link_lost(reason);
    }
}

#[derive(Default)]
struct PortState {
    written: Mutex<Vec<Vec<u8>>>,
    opened: Mutex<Vec<String>>,
    failing: AtomicBool,
    unavailable: AtomicBool,
    opens: AtomicUsize,
}

/// Simulated MIDI output port that records everything written to it.
#[derive(Clone, Default)]
pub struct SimPortOpener {
    state: Arc<PortState>,
}

impl SimPortOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Make opening the port fail as if it did not exist.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state.written).clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Port names passed to every successful open, in order.
    pub fn opened_ports(&self) -> Vec<String> {
        lock(&self.state.opened).clone()
    }
}

impl MidiPortOpener for SimPortOpener {
    fn open(&self, port_name: &str) -> Result<Box<dyn MidiSink>, SinkError> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::PortNotFound(port_name.to_string()));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.opened).push(port_name.to_string());
        Ok(Box::new(SimPort {
            state: self.state.clone(),
        }))
    }
}

struct SimPort {
    state: Arc<PortState>,
}

impl MidiSink for SimPort {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Send("simulated port failure".to_string()));
        }
        lock(&self.state.written).push(bytes.to_vec());
        Ok(())
    }
}
