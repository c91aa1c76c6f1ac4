//! BLE-MIDI GATT identifiers and WinRT buffer helpers.

use crate::bridge::transport::{MIDI_CHARACTERISTIC_UUID, MIDI_SERVICE_UUID};
use anyhow::Result;
use windows::core::GUID;
use windows::Storage::Streams::{DataReader, IBuffer};

pub fn midi_service() -> Result<GUID> {
    parse_uuid(MIDI_SERVICE_UUID)
}

pub fn midi_characteristic() -> Result<GUID> {
    parse_uuid(MIDI_CHARACTERISTIC_UUID)
}

/// Copy a notification payload out of its WinRT buffer.
pub fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    if length > 0 {
        reader.ReadBytes(&mut bytes)?;
    }
    Ok(bytes)
}

/// Parse a UUID string into a Windows GUID
pub fn parse_uuid(uuid_str: &str) -> Result<GUID> {
    let uuid_str = uuid_str.replace('-', "");

    if uuid_str.len() != 32 {
        return Err(anyhow::anyhow!("Invalid UUID format: {}", uuid_str));
    }

    let d1 = u32::from_str_radix(&uuid_str[0..8], 16)?;
    let d2 = u16::from_str_radix(&uuid_str[8..12], 16)?;
    let d3 = u16::from_str_radix(&uuid_str[12..16], 16)?;

    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&uuid_str[16 + i * 2..18 + i * 2], 16)?;
    }

    Ok(GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_midi_uuids() {
        let service = midi_service().unwrap();
        assert_eq!(service.data1, 0x03b80e5a);
        assert_eq!(service.data2, 0xede8);
        assert_eq!(service.data4, [0xa7, 0x51, 0x6c, 0xe3, 0x4e, 0xc4, 0xc7, 0x00]);

        let characteristic = midi_characteristic().unwrap();
        assert_eq!(characteristic.data1, 0x7772e5db);
        assert_eq!(characteristic.data3, 0x4112);
    }

    #[test]
    fn test_parse_uuid_rejects_short_input() {
        assert!(parse_uuid("7772e5db-3868").is_err());
    }
}
