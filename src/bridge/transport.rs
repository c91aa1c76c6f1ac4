//! BLE transport traits
//!
//! The platform BLE stack sits behind these traits. Implementations push
//! advertisements and notifications into bounded channels from their own
//! callback threads, so the supervisor consumes them as a pull-based loop.

use crate::domain::error::BridgeResult;
use crate::domain::models::DeviceDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Standard BLE-MIDI GATT service.
pub const MIDI_SERVICE_UUID: &str = "03b80e5a-ede8-4b33-a751-6ce34ec4c700";

/// The single notifiable BLE-MIDI I/O characteristic.
pub const MIDI_CHARACTERISTIC_UUID: &str = "7772e5db-3868-4112-a1a9-f2669d106bf3";

/// Capacity of the advertisement channel handed out by a scan.
pub const ADVERTISEMENT_QUEUE_DEPTH: usize = 64;

/// Capacity of the notification channel between the BLE stack and the
/// supervisor. Callback threads use `try_send` and drop on overflow.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 256;

/// A subscribed notification stream.
pub struct Subscription {
    /// Payloads of GATT notifications, in arrival order.
    pub notifications: mpsc::Receiver<Vec<u8>>,
    /// Set when the link drops. Kept apart from `notifications` so a full
    /// queue can never swallow it.
    pub lost: watch::Receiver<Option<String>>,
}

/// Platform side of a [`Subscription`], cloned into each callback.
#[derive(Clone)]
pub struct LinkSender {
    notifications: mpsc::Sender<Vec<u8>>,
    lost: Arc<watch::Sender<Option<String>>>,
}

impl LinkSender {
    /// Queue a notification without blocking. Returns false if it was dropped.
    pub fn notify(&self, packet: Vec<u8>) -> bool {
        self.notifications.try_send(packet).is_ok()
    }

    /// Queue a notification, waiting for room. Returns false once the
    /// subscription is gone.
    pub async fn notify_wait(&self, packet: Vec<u8>) -> bool {
        self.notifications.send(packet).await.is_ok()
    }

    /// Report that the link dropped.
    pub fn link_lost(&self, reason: &str) {
        self.lost.send_replace(Some(reason.to_string()));
    }
}

pub fn subscription() -> (LinkSender, Subscription) {
    let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
    let (lost_tx, lost_rx) = watch::channel(None);
    (
        LinkSender {
            notifications: notifications_tx,
            lost: Arc::new(lost_tx),
        },
        Subscription {
            notifications: notifications_rx,
            lost: lost_rx,
        },
    )
}

/// BLE central role: scanning and link establishment.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    type Link: BleLink;

    /// Start scanning. Advertisements arrive on the returned channel until
    /// [`stop_scan`](Self::stop_scan) is called.
    async fn start_scan(&self) -> BridgeResult<mpsc::Receiver<DeviceDescriptor>>;

    /// Stop scanning. Must be harmless when no scan is running.
    async fn stop_scan(&self);

    /// Establish the physical link. Dropping the future aborts the attempt.
    async fn connect(&self, device: &DeviceDescriptor) -> BridgeResult<Self::Link>;
}

/// An established link to the MIDI peripheral.
#[async_trait]
pub trait BleLink: Send + 'static {
    /// Enable notifications on the MIDI characteristic. Link loss is
    /// reported through [`Subscription::lost`].
    async fn subscribe(&mut self) -> BridgeResult<Subscription>;

    /// Release the link. Must be harmless on an already dropped link.
    async fn disconnect(&mut self);
}
