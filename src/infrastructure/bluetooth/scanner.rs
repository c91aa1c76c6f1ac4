//! BLE Scanner Module
//!
//! Wraps the WinRT advertisement watcher and forwards named advertisements
//! to the locator.

use crate::domain::models::DeviceDescriptor;
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, trace};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl BleScanner {
    pub fn new() -> Self {
        Self { watcher: None }
    }

    /// Start an active scan. Advertisements without a local name are skipped;
    /// names usually arrive in the scan response.
    pub fn start(&mut self, sender: mpsc::Sender<DeviceDescriptor>) -> Result<()> {
        self.stop()?;
        info!("Starting BLE advertisement watcher");

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    if name.is_empty() {
                        return Ok(());
                    }

                    let device = DeviceDescriptor {
                        address: args.BluetoothAddress()?,
                        name,
                        signal_strength: args.RawSignalStrengthInDBm()?,
                    };
                    trace!("Advertisement: {} ({})", device.name, device.address_string());

                    // Full means the locator has not caught up; the device
                    // will advertise again.
                    let _ = sender.try_send(device);
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);

        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE advertisement watcher");
            watcher.Stop()?;
        }
        Ok(())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
