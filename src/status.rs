//! Decoded earbud status and the records emitted once per tick.

use crate::window::BeaconObservation;
use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::fmt;

/// Timestamp layout used in every emitted record.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Note attached to degraded records when a payload exists but cannot be decoded.
pub const NOTE_UNSUPPORTED_LENGTH: &str = "Manufacturer frame present but unsupported length";

/// Note attached to degraded records for devices matched only by name.
pub const NOTE_NAME_ONLY: &str = "Matched by name only";

/// Earbud model, selected by a single payload digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Model {
    AirPods1,
    AirPods2,
    AirPods3,
    AirPodsPro,
    AirPodsMax,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Model {
    /// Look up the model for the hexadecimal digit at the model offset.
    pub fn from_digit(digit: char) -> Self {
        match digit.to_ascii_lowercase() {
            '2' => Model::AirPods1,
            'f' => Model::AirPods2,
            '3' => Model::AirPods3,
            'e' => Model::AirPodsPro,
            'a' => Model::AirPodsMax,
            _ => Model::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Model::AirPods1 => "AirPods1",
            Model::AirPods2 => "AirPods2",
            Model::AirPods3 => "AirPods3",
            Model::AirPodsPro => "AirPodsPro",
            Model::AirPodsMax => "AirPodsMax",
            Model::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battery and charging state decoded from one status payload.
///
/// Charge levels are percentages in `0..=100`; `None` means the earbud or
/// case did not report a level (out of range, or not in the case).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStatus {
    pub model: Model,
    pub charge_left: Option<u8>,
    pub charge_right: Option<u8>,
    pub charge_case: Option<u8>,
    pub charging_left: bool,
    pub charging_right: bool,
    pub charging_case: bool,
    /// Local time the payload was decoded
    pub captured_at: DateTime<Local>,
    /// The hex payload the status was decoded from
    pub raw_payload: String,
}

/// One emitted line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    Full(FullReport),
    Degraded(DegradedReport),
    NotFound(NotFoundReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotFoundReport {
    status: u8,
    model: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedReport {
    status: u8,
    pub model: &'static str,
    pub note: &'static str,
    pub rssi: Option<i16>,
    pub name: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullReport {
    status: u8,
    pub charge: Charge,
    pub charging_left: bool,
    pub charging_right: bool,
    pub charging_case: bool,
    pub model: Model,
    pub date: String,
    pub raw: String,
}

/// Charge levels as emitted; unknown levels serialize as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Charge {
    #[serde(serialize_with = "percent_or_unknown")]
    pub left: Option<u8>,
    #[serde(serialize_with = "percent_or_unknown")]
    pub right: Option<u8>,
    #[serde(serialize_with = "percent_or_unknown")]
    pub case: Option<u8>,
}

fn percent_or_unknown<S>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i16(value.map_or(-1, i16::from))
}

impl StatusReport {
    /// Record for a tick where no qualifying device is in the window.
    pub fn not_found() -> Self {
        StatusReport::NotFound(NotFoundReport {
            status: 0,
            model: "AirPods not found",
        })
    }

    /// Record for a device that was seen but whose payload could not be decoded.
    pub fn degraded(observation: &BeaconObservation, now: DateTime<Local>) -> Self {
        let model = if observation.name.is_empty() {
            "Apple device detected"
        } else {
            "AirPods detected"
        };
        let note = if observation.manufacturer_payload.is_some() {
            NOTE_UNSUPPORTED_LENGTH
        } else {
            NOTE_NAME_ONLY
        };

        StatusReport::Degraded(DegradedReport {
            status: 0,
            model,
            note,
            rssi: observation.rssi,
            name: observation.name.clone(),
            date: now.format(DATE_FORMAT).to_string(),
        })
    }

    /// Whether the record carries a fully decoded status.
    pub fn is_decoded(&self) -> bool {
        matches!(self, StatusReport::Full(_))
    }
}

impl From<&DecodedStatus> for StatusReport {
    fn from(status: &DecodedStatus) -> Self {
        StatusReport::Full(FullReport {
            status: 1,
            charge: Charge {
                left: status.charge_left,
                right: status.charge_right,
                case: status.charge_case,
            },
            charging_left: status.charging_left,
            charging_right: status.charging_right,
            charging_case: status.charging_case,
            model: status.model,
            date: status.captured_at.format(DATE_FORMAT).to_string(),
            raw: status.raw_payload.clone(),
        })
    }
}
