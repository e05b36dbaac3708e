use super::u32_at;
use crate::error::{Error, Result};

/// Decode the clock characteristic payload.
///
/// Newer firmware sends 5 bytes (u32 epoch seconds plus an i8 timezone
/// offset in hours), older firmware only the 4-byte timestamp.
pub(crate) fn decode(payload: &[u8]) -> Result<(u32, i8)> {
    match payload.len() {
        5.. => Ok((u32_at(payload, 0), payload[4] as i8)),
        4 => Ok((u32_at(payload, 0), 0)),
        _ => Err(Error::Payload {
            what: "time",
            payload: payload.to_vec(),
        }),
    }
}

/// Encode a clock payload for writing to the device.
pub(crate) fn encode(epoch: u32, tz_offset_hours: i8) -> [u8; 5] {
    let mut payload = [0u8; 5];
    payload[..4].copy_from_slice(&epoch.to_le_bytes());
    payload[4] = tz_offset_hours as u8;
    payload
}

#[test]
fn test_decode_with_tz() {
    let payload = hex::decode("00f1536501").unwrap();
    assert_eq!(decode(&payload).unwrap(), (1_700_000_000, 1));
}

#[test]
fn test_decode_without_tz() {
    let payload = hex::decode("00f15365").unwrap();
    assert_eq!(decode(&payload).unwrap(), (1_700_000_000, 0));
}

#[test]
fn test_decode_negative_tz() {
    let payload = hex::decode("00f15365fb").unwrap();
    assert_eq!(decode(&payload).unwrap(), (1_700_000_000, -5));
}

#[test]
fn test_decode_short() {
    assert!(decode(&[0x00, 0xf1]).is_err());
}

#[test]
fn test_encode_roundtrip() {
    let payload = encode(1_700_000_000, -5);
    assert_eq!(hex::encode(payload), "00f15365fb");
    assert_eq!(decode(&payload).unwrap(), (1_700_000_000, -5));
}
