use chrono::{DateTime, Local};

/// A single reading reported by a sensor
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorData {
    /// Air temperature in °C
    pub temperature: f32,
    /// Relative humidity in %
    pub humidity: u8,
    /// Cell voltage in V. Only reported by the LYWSD03MMC.
    pub voltage: Option<f32>,
    /// Estimated battery charge in %, derived from the cell voltage.
    /// Only available for the LYWSD03MMC; the LYWSD02 reports its battery
    /// level through a dedicated characteristic instead.
    pub battery: Option<f32>,
}

/// One hourly min/max record from the on-device history
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryRecord {
    /// Position of the record in the device's ring buffer
    pub index: u32,
    /// End of the hour the record covers
    pub time: DateTime<Local>,
    pub max_temperature: f32,
    pub max_humidity: u8,
    pub min_temperature: f32,
    pub min_humidity: u8,
}
