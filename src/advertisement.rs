//! Advertisement events and the filter that turns them into observations.

use crate::mac_address::MacAddress;
use crate::window::BeaconObservation;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::debug;

/// Apple's Bluetooth SIG company identifier.
pub const APPLE_MANUFACTURER_ID: u16 = 0x004C;

/// Weakest signal accepted by default, in dBm.
pub const DEFAULT_MIN_RSSI: i16 = -90;

/// Payload prefix length shown in debug logs.
const LOG_PAYLOAD_DIGITS: usize = 64;

/// One advertisement as reported by a scanning backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvertisementEvent {
    pub address: MacAddress,
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
    /// Manufacturer-specific data keyed by company ID
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Decides which advertisements belong to the earbuds being tracked.
#[derive(Debug, Clone)]
pub struct AdvertisementFilter {
    manufacturer_id: u16,
    name_hints: Vec<String>,
    min_rssi: i16,
}

impl AdvertisementFilter {
    /// Create a filter; hints are matched case-insensitively and empty hints are ignored.
    pub fn new(manufacturer_id: u16, name_hints: &[String], min_rssi: i16) -> Self {
        let name_hints = name_hints
            .iter()
            .map(|hint| hint.trim().to_lowercase())
            .filter(|hint| !hint.is_empty())
            .collect();

        AdvertisementFilter {
            manufacturer_id,
            name_hints,
            min_rssi,
        }
    }

    fn matches_name(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let name = name.to_lowercase();
        self.name_hints.iter().any(|hint| name.contains(hint.as_str()))
    }

    /// Build an observation from `event` if it qualifies, stamped with the current time.
    pub fn observe(&self, event: &AdvertisementEvent) -> Option<BeaconObservation> {
        self.observe_at(event, Instant::now())
    }

    /// [`observe`](Self::observe) with an explicit capture time.
    ///
    /// An event qualifies when it carries the vendor's manufacturer data or a
    /// name containing one of the hints, and its RSSI is at least the minimum.
    pub fn observe_at(&self, event: &AdvertisementEvent, now: Instant) -> Option<BeaconObservation> {
        let name = event.name.as_deref().unwrap_or_default();
        let vendor_data = event.manufacturer_data.get(&self.manufacturer_id);

        if vendor_data.is_none() && !self.matches_name(name) {
            return None;
        }
        let rssi = event.rssi.filter(|rssi| *rssi >= self.min_rssi)?;

        let payload = vendor_data.map(hex::encode);
        debug!(
            addr = %event.address,
            rssi,
            name,
            vendor = vendor_data.is_some(),
            hex = %payload_preview(payload.as_deref()),
            "qualifying advertisement"
        );

        Some(BeaconObservation {
            device_address: event.address,
            rssi: Some(rssi),
            manufacturer_payload: payload,
            name: name.to_string(),
            observed_at: now,
        })
    }
}

fn payload_preview(payload: Option<&str>) -> String {
    match payload {
        Some(hex) if hex.len() > LOG_PAYLOAD_DIGITS => format!("{}...", &hex[..LOG_PAYLOAD_DIGITS]),
        Some(hex) => format!("{hex}..."),
        None => "None".to_string(),
    }
}
