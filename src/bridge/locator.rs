//! Device Locator
//!
//! Filters advertisements down to the configured peripheral.

use crate::bridge::transport::BleTransport;
use crate::domain::error::{BridgeError, BridgeResult};
use crate::domain::models::DeviceDescriptor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Case-sensitive substring match against the advertised name.
pub fn matches_name(pattern: &str, name: &str) -> bool {
    !pattern.is_empty() && name.contains(pattern)
}

pub struct DeviceLocator<T> {
    transport: Arc<T>,
}

impl<T> Clone for DeviceLocator<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T: BleTransport> DeviceLocator<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Start a scan that yields matching devices until `timeout` elapses.
    pub async fn scan(&self, pattern: &str, timeout: Duration) -> BridgeResult<Scan> {
        info!("Scanning for devices matching {:?}", pattern);
        let advertisements = self.transport.start_scan().await?;
        Ok(Scan {
            advertisements,
            pattern: pattern.to_string(),
            deadline: Instant::now() + timeout,
            seen: HashSet::new(),
        })
    }

    /// First matching device observed during one scan window.
    pub async fn find_first(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> BridgeResult<DeviceDescriptor> {
        let mut scan = self.scan(pattern, timeout).await?;
        let found = scan.next().await;
        drop(scan);
        self.transport.stop_scan().await;
        found.ok_or(BridgeError::ScanTimeout)
    }
}

/// One scan window. Finite: ends at the deadline or when the platform stops
/// delivering advertisements.
pub struct Scan {
    advertisements: mpsc::Receiver<DeviceDescriptor>,
    pattern: String,
    deadline: Instant,
    seen: HashSet<u64>,
}

impl Scan {
    /// Next matching device not yet yielded by this scan, in arrival order.
    pub async fn next(&mut self) -> Option<DeviceDescriptor> {
        loop {
            let device =
                match tokio::time::timeout_at(self.deadline, self.advertisements.recv()).await {
                    Ok(Some(device)) => device,
                    Ok(None) | Err(_) => return None,
                };

            if !matches_name(&self.pattern, &device.name) {
                continue;
            }
            if !self.seen.insert(device.address) {
                continue;
            }

            debug!(
                "Matched {} ({}) at {} dBm",
                device.name,
                device.address_string(),
                device.signal_strength
            );
            return Some(device);
        }
    }
}
