//! Read current and historical measurements from Xiaomi Mijia LYWSD02 and
//! LYWSD03MMC temperature/humidity sensors over Bluetooth Low Energy.
//!
//! The sensors expose their readings through a set of GATT characteristics;
//! current data arrives as notifications, the hourly min/max history is
//! streamed record by record. Devices are addressed by MAC address and only
//! connected for the duration of an operation, so polling does not keep
//! them awake.
//!
//! Currently the following data can be accessed:
//!
//! - Temperature (°C) and relative humidity (%)
//! - Battery charge (%), for the LYWSD03MMC estimated from the cell voltage
//! - Hourly min/max history records
//! - Device clock and display unit (read and, where supported, write)
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! #
//! # #[tokio::main]
//! # pub async fn main() -> lywsdread::Result<()> {
//!     let mut sensor = lywsdread::SensorClient::lywsd03("A4:C1:38:01:23:45")?;
//!     loop {
//!         let data = sensor.data().await?;
//!         println!("{:.2} °C, {} %", data.temperature, data.humidity);
//!         tokio::time::sleep(Duration::from_secs(60)).await;
//!     }
//! # }
//! ```
//!
//! For supervising several sensors at once, [`SensorManager`] polls a whole
//! fleet, keeps a per-device quality score and resets the radio when too
//! many devices are failing.

mod error;
mod manager;
mod message;
mod model;
pub mod radio;
mod sensor_client;
mod sensor_data;

pub use error::{Error, Result};
pub use manager::{DeviceState, SensorManager};
pub use model::{Model, TemperatureUnit};
pub use sensor_client::SensorClient;
pub use sensor_data::{HistoryRecord, SensorData};
