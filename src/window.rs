//! Time-bounded window of recent beacon observations.
//!
//! Every qualifying advertisement is appended; entries older than the horizon
//! are dropped lazily whenever the window is touched. Selection picks the
//! strongest signal so that, with several earbud sets nearby, the one closest
//! to the adapter is reported.

use crate::mac_address::MacAddress;
use std::time::Duration;
use tokio::time::Instant;

/// How long an observation stays eligible for selection.
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(10);

/// Stand-in for a missing RSSI; loses against every reported value.
const RSSI_FLOOR: i16 = i16::MIN;

/// A qualifying advertisement, captured by the filter.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconObservation {
    pub device_address: MacAddress,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
    /// Lowercase hex of the vendor's manufacturer data, absent for name-only matches
    pub manufacturer_payload: Option<String>,
    /// Advertised local name, empty if none was seen
    pub name: String,
    pub observed_at: Instant,
}

impl BeaconObservation {
    fn strength(&self) -> i16 {
        self.rssi.unwrap_or(RSSI_FLOOR)
    }
}

/// Recent observations in insertion order.
#[derive(Debug)]
pub struct BeaconWindow {
    horizon: Duration,
    entries: Vec<BeaconObservation>,
}

impl Default for BeaconWindow {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON)
    }
}

impl BeaconWindow {
    pub fn new(horizon: Duration) -> Self {
        BeaconWindow {
            horizon,
            entries: Vec::new(),
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Number of entries currently held, including any not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an observation and return the strongest one still in the window.
    pub fn insert(&mut self, observation: BeaconObservation) -> Option<BeaconObservation> {
        self.insert_at(observation, Instant::now())
    }

    /// [`insert`](Self::insert) with an explicit current time.
    ///
    /// When the strongest entry belongs to the device that was just inserted,
    /// the inserted observation is returned with `observed_at` set to `now`,
    /// so a device that keeps re-advertising is reported as freshly seen.
    /// Stored entries are left untouched.
    pub fn insert_at(
        &mut self,
        observation: BeaconObservation,
        now: Instant,
    ) -> Option<BeaconObservation> {
        let mut latest = observation.clone();
        self.entries.push(observation);

        let strongest = self.strongest_index_at(now)?;
        if self.entries[strongest].device_address == latest.device_address {
            latest.observed_at = now;
            Some(latest)
        } else {
            Some(self.entries[strongest].clone())
        }
    }

    /// The strongest observation within the horizon, if any.
    pub fn strongest(&mut self) -> Option<BeaconObservation> {
        self.strongest_at(Instant::now())
    }

    /// [`strongest`](Self::strongest) with an explicit current time.
    ///
    /// Ties on RSSI go to the earliest inserted entry.
    pub fn strongest_at(&mut self, now: Instant) -> Option<BeaconObservation> {
        self.strongest_index_at(now)
            .map(|index| self.entries[index].clone())
    }

    fn strongest_index_at(&mut self, now: Instant) -> Option<usize> {
        self.evict(now);

        let mut best: Option<usize> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            match best {
                Some(current) if entry.strength() <= self.entries[current].strength() => {}
                _ => best = Some(index),
            }
        }
        best
    }

    fn evict(&mut self, now: Instant) {
        let horizon = self.horizon;
        self.entries
            .retain(|entry| now.saturating_duration_since(entry.observed_at) <= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_MAC, observation};

    const OTHER_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const EPSILON: Duration = Duration::from_millis(1);

    fn observed(mac: MacAddress, rssi: Option<i16>, at: Instant) -> BeaconObservation {
        let mut obs = observation(mac, rssi, None);
        obs.observed_at = at;
        obs
    }

    #[test]
    fn test_empty_window_has_no_strongest() {
        let mut window = BeaconWindow::default();
        assert_eq!(window.strongest(), None);
        assert!(window.is_empty());
    }

    #[test]
    fn test_strongest_picks_highest_rssi() {
        let now = Instant::now();
        let mut window = BeaconWindow::default();
        window.insert_at(observed(TEST_MAC, Some(-80), now), now);
        window.insert_at(observed(OTHER_MAC, Some(-40), now), now);

        let strongest = window.strongest_at(now).unwrap();
        assert_eq!(strongest.device_address, OTHER_MAC);
        assert_eq!(strongest.rssi, Some(-40));
    }

    #[test]
    fn test_tie_goes_to_earliest_insert() {
        let now = Instant::now();
        let mut window = BeaconWindow::default();
        window.insert_at(observed(TEST_MAC, Some(-60), now), now);
        window.insert_at(observed(OTHER_MAC, Some(-60), now), now);

        assert_eq!(window.strongest_at(now).unwrap().device_address, TEST_MAC);
    }

    #[test]
    fn test_missing_rssi_loses_to_any_reading() {
        let now = Instant::now();
        let mut window = BeaconWindow::default();
        window.insert_at(observed(TEST_MAC, None, now), now);
        window.insert_at(observed(OTHER_MAC, Some(-127), now), now);

        assert_eq!(window.strongest_at(now).unwrap().device_address, OTHER_MAC);
    }

    #[test]
    fn test_eviction_at_horizon_boundary() {
        let start = Instant::now();
        let mut window = BeaconWindow::default();
        window.insert_at(observed(TEST_MAC, Some(-50), start), start);

        let just_inside = start + DEFAULT_HORIZON - EPSILON;
        assert!(window.strongest_at(just_inside).is_some());

        let just_outside = start + DEFAULT_HORIZON + EPSILON;
        assert!(window.strongest_at(just_outside).is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_expired_strong_entry_yields_to_fresh_weak_one() {
        let start = Instant::now();
        let mut window = BeaconWindow::default();
        window.insert_at(observed(TEST_MAC, Some(-30), start), start);

        let later = start + DEFAULT_HORIZON + Duration::from_secs(1);
        window.insert_at(observed(OTHER_MAC, Some(-90), later), later);

        assert_eq!(window.strongest_at(later).unwrap().device_address, OTHER_MAC);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_insert_refreshes_timestamp_of_leading_device() {
        let start = Instant::now();
        let mut window = BeaconWindow::default();
        window.insert_at(observed(TEST_MAC, Some(-40), start), start);

        // Re-advertisement from the same device carrying an older capture time.
        let now = start + Duration::from_secs(4);
        let leading = window
            .insert_at(observed(TEST_MAC, Some(-70), start), now)
            .unwrap();

        assert_eq!(leading.device_address, TEST_MAC);
        assert_eq!(leading.rssi, Some(-70));
        assert_eq!(leading.observed_at, now);

        // Stored entries keep their capture time.
        let stored = window.strongest_at(now).unwrap();
        assert_eq!(stored.rssi, Some(-40));
        assert_eq!(stored.observed_at, start);
    }

    #[test]
    fn test_insert_returns_other_leader_unchanged() {
        let start = Instant::now();
        let mut window = BeaconWindow::default();
        window.insert_at(observed(OTHER_MAC, Some(-30), start), start);

        let now = start + Duration::from_secs(2);
        let leading = window
            .insert_at(observed(TEST_MAC, Some(-70), now), now)
            .unwrap();

        assert_eq!(leading.device_address, OTHER_MAC);
        assert_eq!(leading.observed_at, start);
    }

    #[test]
    fn test_duplicates_for_same_address_are_tolerated() {
        let now = Instant::now();
        let mut window = BeaconWindow::new(Duration::from_secs(5));
        for rssi in [-70, -65, -75] {
            window.insert_at(observed(TEST_MAC, Some(rssi), now), now);
        }

        assert_eq!(window.len(), 3);
        assert_eq!(window.strongest_at(now).unwrap().rssi, Some(-65));
        assert_eq!(window.horizon(), Duration::from_secs(5));
    }
}
