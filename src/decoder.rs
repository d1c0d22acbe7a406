//! Decoder for the AirPods proximity-pairing status payload.
//!
//! The payload is handled in its hexadecimal form: every field of interest is
//! a single hex digit (nibble) at a fixed offset.
//!
//! | offset | meaning                                             |
//! |--------|-----------------------------------------------------|
//! | 7      | model                                               |
//! | 10     | bit 1 clear: left/right fields are swapped ("flip") |
//! | 12, 13 | left/right battery (order depends on flip)          |
//! | 14     | charging: bit 0/1 left/right (flip), bit 2 case     |
//! | 15     | case battery                                        |

use crate::status::{DecodedStatus, Model};
use chrono::Local;
use thiserror::Error;

/// Payload length (hex digits) of the status frame the decoder targets.
pub const STATUS_PAYLOAD_HEX_LEN: usize = 54;

const MODEL_OFFSET: usize = 7;
const FLIP_OFFSET: usize = 10;
const FIRST_POD_OFFSET: usize = 12;
const SECOND_POD_OFFSET: usize = 13;
const CHARGING_OFFSET: usize = 14;
const CASE_OFFSET: usize = 15;

/// Shortest payload that holds every field read by [`decode_status`].
pub const MIN_PAYLOAD_HEX_LEN: usize = CASE_OFFSET + 1;

const FLIP_BIT: u8 = 0b0010;
const CHARGING_FIRST_BIT: u8 = 0b0001;
const CHARGING_SECOND_BIT: u8 = 0b0010;
const CHARGING_CASE_BIT: u8 = 0b0100;

/// Errors returned for payloads the decoder cannot read.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("payload too short: {len} hex digits, need at least {}", MIN_PAYLOAD_HEX_LEN)]
    TooShort { len: usize },
    #[error("payload digit at offset {offset} is not hexadecimal")]
    InvalidDigit { offset: usize },
}

/// Decode a hex-encoded status payload.
///
/// Callers are expected to check the payload against the configured frame
/// length first; this only guards against input it cannot index.
pub fn decode_status(raw: &str) -> Result<DecodedStatus, DecodeError> {
    let digits = raw.as_bytes();
    if digits.len() < MIN_PAYLOAD_HEX_LEN {
        return Err(DecodeError::TooShort { len: digits.len() });
    }

    let nibble = |offset: usize| -> Result<u8, DecodeError> {
        char::from(digits[offset])
            .to_digit(16)
            .map(|v| v as u8)
            .ok_or(DecodeError::InvalidDigit { offset })
    };

    let flip = nibble(FLIP_OFFSET)? & FLIP_BIT == 0;
    let model = Model::from_digit(char::from(digits[MODEL_OFFSET]));

    let (left_offset, right_offset) = if flip {
        (FIRST_POD_OFFSET, SECOND_POD_OFFSET)
    } else {
        (SECOND_POD_OFFSET, FIRST_POD_OFFSET)
    };
    let (left_bit, right_bit) = if flip {
        (CHARGING_SECOND_BIT, CHARGING_FIRST_BIT)
    } else {
        (CHARGING_FIRST_BIT, CHARGING_SECOND_BIT)
    };

    let charging = nibble(CHARGING_OFFSET)?;

    Ok(DecodedStatus {
        model,
        charge_left: battery_percent(nibble(left_offset)?),
        charge_right: battery_percent(nibble(right_offset)?),
        charge_case: battery_percent(nibble(CASE_OFFSET)?),
        charging_left: charging & left_bit != 0,
        charging_right: charging & right_bit != 0,
        charging_case: charging & CHARGING_CASE_BIT != 0,
        captured_at: Local::now(),
        raw_payload: raw.to_string(),
    })
}

/// Map a battery nibble to a percentage.
///
/// Levels are reported in tenths; `0..=9` is taken as the middle of its
/// bucket, `10` is full, anything above means "not reported".
pub fn battery_percent(level: u8) -> Option<u8> {
    match level {
        10 => Some(100),
        0..=9 => Some(level * 10 + 5),
        _ => None,
    }
}
