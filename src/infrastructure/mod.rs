//! Platform adapters: logging setup, the WinRT BLE stack and midir output.

#[cfg(windows)]
pub mod bluetooth;
pub mod logging;
#[cfg(windows)]
pub mod midi_output;
