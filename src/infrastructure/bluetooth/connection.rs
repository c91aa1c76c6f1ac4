//! BLE Connection Module
//!
//! One WinRT link to a BLE-MIDI peripheral: GATT session, service discovery
//! and notification subscription on the MIDI I/O characteristic.

use crate::bridge::transport::{self, BleLink, Subscription};
use crate::domain::error::{BridgeError, BridgeResult};
use crate::infrastructure::bluetooth::protocol;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;

const SUBSCRIBE_ATTEMPTS: u32 = 3;
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct WinLink {
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    characteristic: Option<GattCharacteristic>,
    value_token: Option<i64>,
    status_token: Option<i64>,
}

impl WinLink {
    /// Open the device by Bluetooth address and hold the connection.
    pub async fn connect(address: u64) -> Result<Self> {
        info!("Connecting to Bluetooth device: {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
        info!("Device opened: {:?}", device.Name()?);

        let session = match Self::create_gatt_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        Ok(Self {
            device: Some(device),
            session,
            characteristic: None,
            value_token: None,
            status_token: None,
        })
    }

    async fn create_gatt_session(device: &BluetoothLEDevice) -> Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    async fn find_characteristic(device: &BluetoothLEDevice) -> Result<GattCharacteristic> {
        let services_result = device
            .GetGattServicesForUuidAsync(protocol::midi_service()?)?
            .await?;
        if services_result.Status()? != GattCommunicationStatus::Success {
            anyhow::bail!("Failed to get GATT services: {:?}", services_result.Status()?);
        }

        let services = services_result.Services()?;
        if services.Size()? == 0 {
            anyhow::bail!("BLE-MIDI service not found");
        }
        let service = services.GetAt(0)?;

        let chars_result = service
            .GetCharacteristicsForUuidAsync(protocol::midi_characteristic()?)?
            .await?;
        if chars_result.Status()? != GattCommunicationStatus::Success {
            anyhow::bail!("Failed to get characteristics: {:?}", chars_result.Status()?);
        }

        let characteristics = chars_result.Characteristics()?;
        if characteristics.Size()? == 0 {
            anyhow::bail!("BLE-MIDI characteristic not found");
        }
        Ok(characteristics.GetAt(0)?)
    }

    async fn enable_notifications(characteristic: &GattCharacteristic) -> Result<()> {
        for attempt in 1..=SUBSCRIBE_ATTEMPTS {
            match characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                )?
                .await
            {
                Ok(status) if status == GattCommunicationStatus::Success => {
                    info!("Notifications enabled");
                    return Ok(());
                }
                Ok(status) => warn!("Notification subscription returned status: {:?}", status),
                Err(e) => warn!("Notification subscription attempt {} failed: {:?}", attempt, e),
            }
            if attempt < SUBSCRIBE_ATTEMPTS {
                tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
            }
        }

        error!("Failed to enable notifications after {} attempts", SUBSCRIBE_ATTEMPTS);
        anyhow::bail!("Failed to enable notifications")
    }

    async fn try_subscribe(&mut self) -> Result<Subscription> {
        let device = self
            .device
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Link already released"))?;

        let characteristic = Self::find_characteristic(&device).await?;
        let (link_sender, subscription) = transport::subscription();

        let sender = link_sender.clone();
        let value_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let packet = protocol::read_buffer(&args.CharacteristicValue()?)?;
                    if !sender.notify(packet) {
                        debug!("Notification queue full, packet dropped");
                    }
                }
                Ok(())
            },
        );
        self.value_token = Some(characteristic.ValueChanged(&value_handler)?);

        let sender = link_sender;
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        sender.link_lost("device disconnected");
                    }
                }
                Ok(())
            });
        self.status_token = Some(device.ConnectionStatusChanged(&status_handler)?);
        self.characteristic = Some(characteristic.clone());

        Self::enable_notifications(&characteristic).await?;
        Ok(subscription)
    }

    fn release(&mut self) {
        if let (Some(characteristic), Some(token)) = (&self.characteristic, self.value_token) {
            let _ = characteristic.RemoveValueChanged(token);
        }
        if let (Some(device), Some(token)) = (&self.device, self.status_token) {
            let _ = device.RemoveConnectionStatusChanged(token);
        }
        self.value_token = None;
        self.status_token = None;
        self.characteristic = None;

        if let Some(session) = self.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = self.device.take() {
            info!("Releasing Bluetooth device");
            let _ = device.Close();
        }
    }
}

#[async_trait]
impl BleLink for WinLink {
    async fn subscribe(&mut self) -> BridgeResult<Subscription> {
        self.try_subscribe()
            .await
            .map_err(|e| BridgeError::SubscribeFailure(e.to_string()))
    }

    async fn disconnect(&mut self) {
        self.release();
    }
}

impl Drop for WinLink {
    fn drop(&mut self) {
        self.release();
    }
}
