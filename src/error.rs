use std::time::Duration;

use btleplug::api::{BDAddr, ParseBDAddrError};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while talking to a sensor
#[derive(Error, Debug)]
pub enum Error {
    /// The device address string could not be parsed as a MAC address
    #[error("invalid device address: {0}")]
    Address(#[from] ParseBDAddrError),

    /// No Bluetooth adapter is present on this host
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// The device did not show up during scanning
    #[error("device {mac} not found")]
    DeviceNotFound { mac: BDAddr },

    /// Connecting to the device failed after retries
    #[error("device {mac} connection failed: {source}")]
    Connect {
        mac: BDAddr,
        source: btleplug::Error,
    },

    /// The device produced no data within the notification timeout
    #[error("no data from device {mac} for {timeout:?}")]
    Timeout { mac: BDAddr, timeout: Duration },

    /// The notification stream ended while a value was still expected
    #[error("notification stream from {mac} ended unexpectedly")]
    StreamClosed { mac: BDAddr },

    /// The device does not expose an expected GATT characteristic
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),

    /// A characteristic payload could not be decoded
    #[error("invalid {what} payload: {payload:02x?}")]
    Payload {
        what: &'static str,
        payload: Vec<u8>,
    },

    /// A caller-supplied value was rejected
    #[error("value error: {0}")]
    Value(String),

    /// The operation is not available on this device model
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A radio control command could not be run
    #[error("radio control: {0}")]
    Radio(String),

    /// Any other error from the underlying BLE stack
    #[error(transparent)]
    Bluetooth(#[from] btleplug::Error),
}

/// Result type alias for sensor operations
pub type Result<T> = std::result::Result<T, Error>;
