use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Local, TimeDelta};

use super::{i16_at, u32_at};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::sensor_data::HistoryRecord;

/// Byte length of one history record on the wire:
/// u32 index, u32 ticks, i16 max temp, u8 max hum, i16 min temp, u8 min hum
const RECORD_LEN: usize = 14;

/// A decoded history record whose timestamp has not been resolved yet.
///
/// The LYWSD02 stamps records with UNIX epoch seconds while the LYWSD03MMC
/// counts seconds since the device started, so `ticks` can only be turned
/// into a wall-clock time once the device start time is known.
#[derive(Debug, PartialEq)]
pub(crate) struct HistoryMessage {
    pub index: u32,
    pub ticks: u32,
    pub max_temperature: f32,
    pub max_humidity: u8,
    pub min_temperature: f32,
    pub min_humidity: u8,
}

impl HistoryMessage {
    /// Resolve the record against a device start time.
    ///
    /// `start_time` must be `Some` for LYWSD03MMC records and `None` for
    /// LYWSD02 records, whose ticks already are epoch seconds.
    pub fn into_record(self, start_time: Option<DateTime<Local>>) -> HistoryRecord {
        let time = match start_time {
            Some(start) => start + TimeDelta::seconds(self.ticks as i64),
            None => DateTime::from(UNIX_EPOCH + Duration::from_secs(u64::from(self.ticks))),
        };
        HistoryRecord {
            index: self.index,
            time,
            max_temperature: self.max_temperature,
            max_humidity: self.max_humidity,
            min_temperature: self.min_temperature,
            min_humidity: self.min_humidity,
        }
    }
}

/// Decode one history notification payload.
///
/// The LYWSD02 stores temperatures in centidegrees, the LYWSD03MMC in
/// decidegrees.
pub(crate) fn decode(model: Model, payload: &[u8]) -> Result<HistoryMessage> {
    if payload.len() < RECORD_LEN {
        return Err(Error::Payload {
            what: "history",
            payload: payload.to_vec(),
        });
    }

    let scale = match model {
        Model::Lywsd02 => 100.0,
        Model::Lywsd03 => 10.0,
    };
    Ok(HistoryMessage {
        index: u32_at(payload, 0),
        ticks: u32_at(payload, 4),
        max_temperature: i16_at(payload, 8) as f32 / scale,
        max_humidity: payload[10],
        min_temperature: i16_at(payload, 11) as f32 / scale,
        min_humidity: payload[13],
    })
}

#[test]
fn test_decode_lywsd03_record() {
    // index 5, 3600 s after start, 24.5 °C / 60 % max, 21.0 °C / 45 % min
    let payload = hex::decode("05000000100e0000f5003cd2002d").unwrap();
    let message = decode(Model::Lywsd03, &payload).unwrap();
    assert_eq!(message.index, 5);
    assert_eq!(message.ticks, 3600);
    assert!((message.max_temperature - 24.5).abs() < 1e-4);
    assert_eq!(message.max_humidity, 60);
    assert!((message.min_temperature - 21.0).abs() < 1e-4);
    assert_eq!(message.min_humidity, 45);
}

#[test]
fn test_decode_lywsd02_record() {
    // index 7, epoch 1700000000, 24.5 °C / 60 % max, 21.0 °C / 45 % min
    let payload = hex::decode("0700000000f1536592093c34082d").unwrap();
    let message = decode(Model::Lywsd02, &payload).unwrap();
    assert_eq!(message.index, 7);
    assert_eq!(message.ticks, 1_700_000_000);
    assert!((message.max_temperature - 24.5).abs() < 1e-4);
    assert!((message.min_temperature - 21.0).abs() < 1e-4);
}

#[test]
fn test_decode_short_record() {
    let payload = hex::decode("05000000100e0000").unwrap();
    assert!(matches!(
        decode(Model::Lywsd03, &payload),
        Err(Error::Payload { what: "history", .. })
    ));
}

#[test]
fn test_into_record_with_start_time() {
    let payload = hex::decode("05000000100e0000f5003cd2002d").unwrap();
    let message = decode(Model::Lywsd03, &payload).unwrap();
    let start = Local::now();
    let record = message.into_record(Some(start));
    assert_eq!(record.time, start + TimeDelta::seconds(3600));
    assert_eq!(record.index, 5);
}

#[test]
fn test_into_record_epoch() {
    let payload = hex::decode("0700000000f1536592093c34082d").unwrap();
    let record = decode(Model::Lywsd02, &payload).unwrap().into_record(None);
    assert_eq!(record.time.timestamp(), 1_700_000_000);
}
