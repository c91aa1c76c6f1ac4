//! WinRT implementation of the bridge's BLE transport.

use crate::bridge::transport::{BleTransport, ADVERTISEMENT_QUEUE_DEPTH};
use crate::domain::error::{BridgeError, BridgeResult};
use crate::domain::models::DeviceDescriptor;
use crate::infrastructure::bluetooth::connection::WinLink;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

pub struct WinRtTransport {
    scanner: Mutex<BleScanner>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self {
            scanner: Mutex::new(BleScanner::new()),
        }
    }
}

impl Default for WinRtTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    type Link = WinLink;

    async fn start_scan(&self) -> BridgeResult<mpsc::Receiver<DeviceDescriptor>> {
        let (tx, rx) = mpsc::channel(ADVERTISEMENT_QUEUE_DEPTH);
        let mut scanner = self
            .scanner
            .lock()
            .map_err(|_| BridgeError::ScanFailure("scanner lock poisoned".to_string()))?;
        scanner
            .start(tx)
            .map_err(|e| BridgeError::ScanFailure(e.to_string()))?;
        Ok(rx)
    }

    async fn stop_scan(&self) {
        if let Ok(mut scanner) = self.scanner.lock() {
            if let Err(e) = scanner.stop() {
                warn!("Failed to stop BLE scan: {}", e);
            }
        }
    }

    async fn connect(&self, device: &DeviceDescriptor) -> BridgeResult<WinLink> {
        WinLink::connect(device.address)
            .await
            .map_err(|e| BridgeError::ConnectFailure(e.to_string()))
    }
}
