use super::i16_at;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::sensor_data::SensorData;

/// CR2025 / CR2032 cells measure 3.4 V at most (see the Farnell datasheets
/// for both types). End voltage is 2.0 V but the radio on most devices stops
/// working somewhere below 2.3 V.
const BATTERY_FULL_V: f32 = 3.4;
const BATTERY_LOW_V: f32 = 2.21;

/// Byte length of a LYWSD02 sensor notification: temperature + humidity
const LEN_LYWSD02: usize = 3;
/// Byte length of a LYWSD03MMC sensor notification: temperature + humidity + voltage
const LEN_LYWSD03: usize = 5;

/// Decode a sensor-data notification payload.
///
/// Both models start with the temperature in centidegrees (i16) followed by
/// the humidity in % (u8). The LYWSD03MMC appends its cell voltage in mV
/// (i16), from which the battery charge is estimated.
pub(crate) fn decode(model: Model, payload: &[u8]) -> Result<SensorData> {
    let needed = match model {
        Model::Lywsd02 => LEN_LYWSD02,
        Model::Lywsd03 => LEN_LYWSD03,
    };
    if payload.len() < needed {
        return Err(Error::Payload {
            what: "sensor",
            payload: payload.to_vec(),
        });
    }

    let temperature = i16_at(payload, 0) as f32 / 100.0;
    let humidity = payload[2];
    match model {
        Model::Lywsd02 => Ok(SensorData {
            temperature,
            humidity,
            voltage: None,
            battery: None,
        }),
        Model::Lywsd03 => {
            let voltage = i16_at(payload, 3) as f32 / 1000.0;
            Ok(SensorData {
                temperature,
                humidity,
                voltage: Some(voltage),
                battery: Some(estimate_battery(voltage)),
            })
        }
    }
}

/// Estimate the remaining battery charge in % from the cell voltage,
/// rounded to one decimal. The estimate is not clamped; a fresh cell can
/// report slightly above 100 %.
pub(crate) fn estimate_battery(voltage: f32) -> f32 {
    let pct = (voltage - BATTERY_LOW_V) / (BATTERY_FULL_V - BATTERY_LOW_V) * 100.0;
    (pct * 10.0).round() / 10.0
}

#[test]
fn test_decode_lywsd03() {
    // 21.61 °C, 54 %, 2.992 V
    let payload = hex::decode("710836b00b").unwrap();
    let data = decode(Model::Lywsd03, &payload).unwrap();
    assert!((data.temperature - 21.61).abs() < 1e-4);
    assert_eq!(data.humidity, 54);
    assert!((data.voltage.unwrap() - 2.992).abs() < 1e-4);
    assert!((data.battery.unwrap() - 65.7).abs() < 1e-4);
}

#[test]
fn test_decode_lywsd02() {
    // 23.45 °C, 48 %
    let payload = hex::decode("290930").unwrap();
    let data = decode(Model::Lywsd02, &payload).unwrap();
    assert!((data.temperature - 23.45).abs() < 1e-4);
    assert_eq!(data.humidity, 48);
    assert_eq!(data.voltage, None);
    assert_eq!(data.battery, None);
}

#[test]
fn test_decode_negative_temperature() {
    // -5.12 °C, 42 %
    let payload = hex::decode("00fe2a").unwrap();
    let data = decode(Model::Lywsd02, &payload).unwrap();
    assert!((data.temperature + 5.12).abs() < 1e-4);
    assert_eq!(data.humidity, 42);
}

#[test]
fn test_decode_truncated_payload() {
    // A 3-byte LYWSD02 payload is too short for the LYWSD03MMC layout
    let payload = hex::decode("290930").unwrap();
    assert!(matches!(
        decode(Model::Lywsd03, &payload),
        Err(Error::Payload { what: "sensor", .. })
    ));
}

#[test]
fn test_battery_estimate_bounds() {
    assert!((estimate_battery(3.4) - 100.0).abs() < 1e-4);
    assert!(estimate_battery(2.21).abs() < 1e-4);
    // Fresh cells can sit slightly above the nominal full voltage
    assert!(estimate_battery(3.45) > 100.0);
}
