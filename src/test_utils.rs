use crate::advertisement::{APPLE_MANUFACTURER_ID, AdvertisementEvent};
use crate::mac_address::MacAddress;
use crate::reset::AdapterReset;
use crate::scanner::{BoxFuture, ScanError, ScanFacility};
use crate::window::BeaconObservation;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A 54-digit status frame; the decoded nibbles are overwritten by [`status_payload`].
const PAYLOAD_TEMPLATE: &str = "0719010e200f8a31000455aa1d7e3c9b14a2e0f7d9c01b2a6e53f0";

/// Build an observation captured now with an empty name.
pub fn observation(mac: MacAddress, rssi: Option<i16>, payload: Option<&str>) -> BeaconObservation {
    BeaconObservation {
        device_address: mac,
        rssi,
        manufacturer_payload: payload.map(str::to_string),
        name: String::new(),
        observed_at: Instant::now(),
    }
}

/// Build an advertisement from [`TEST_MAC`], with `payload` under the Apple company ID.
pub fn advertisement(
    name: Option<&str>,
    rssi: Option<i16>,
    payload: Option<Vec<u8>>,
) -> AdvertisementEvent {
    let mut manufacturer_data = HashMap::new();
    if let Some(payload) = payload {
        manufacturer_data.insert(APPLE_MANUFACTURER_ID, payload);
    }
    AdvertisementEvent {
        address: TEST_MAC,
        name: name.map(str::to_string),
        rssi,
        manufacturer_data,
    }
}

/// A full-length status payload with the given digits at the decoded offsets.
pub fn status_payload(
    model: char,
    flip: char,
    first_pod: char,
    second_pod: char,
    charging: char,
    case: char,
) -> String {
    let mut digits: Vec<char> = PAYLOAD_TEMPLATE.chars().collect();
    digits[7] = model;
    digits[10] = flip;
    digits[12] = first_pod;
    digits[13] = second_pod;
    digits[14] = charging;
    digits[15] = case;
    digits.into_iter().collect()
}

/// [`status_payload`] as the bytes a scanner would report.
pub fn status_payload_bytes(
    model: char,
    flip: char,
    first_pod: char,
    second_pod: char,
    charging: char,
    case: char,
) -> Vec<u8> {
    hex::decode(status_payload(model, flip, first_pod, second_pod, charging, case)).unwrap()
}

/// Call counters shared between a [`FakeFacility`] and the test holding it.
#[derive(Debug, Clone, Default)]
pub struct FakeCalls {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    sweeps: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
}

impl FakeCalls {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn sweeps(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Whether a scan session was set up by `start` and not yet torn down by `stop`.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Scripted scanning facility.
///
/// Start and sweep results are consumed in order; once a script runs out,
/// `start` succeeds and sweeps find nothing. Events given to `pushing` are
/// delivered on every successful start. With `hanging_start`, `start` sets up
/// its session and then never completes.
#[derive(Debug, Default)]
pub struct FakeFacility {
    start_results: VecDeque<Result<(), ScanError>>,
    sweep_results: VecDeque<Result<Vec<AdvertisementEvent>, ScanError>>,
    pushed: Vec<AdvertisementEvent>,
    stop_error: Option<ScanError>,
    hang_start: bool,
    calls: FakeCalls,
}

impl FakeFacility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_results(mut self, results: Vec<Result<(), ScanError>>) -> Self {
        self.start_results = results.into();
        self
    }

    pub fn with_sweeps(mut self, results: Vec<Result<Vec<AdvertisementEvent>, ScanError>>) -> Self {
        self.sweep_results = results.into();
        self
    }

    pub fn pushing(mut self, events: Vec<AdvertisementEvent>) -> Self {
        self.pushed = events;
        self
    }

    pub fn with_stop_error(mut self, err: ScanError) -> Self {
        self.stop_error = Some(err);
        self
    }

    pub fn hanging_start(mut self) -> Self {
        self.hang_start = true;
        self
    }

    pub fn calls(&self) -> FakeCalls {
        self.calls.clone()
    }
}

/// `n` consecutive "in progress" start failures.
pub fn in_progress_failures(n: usize) -> Vec<Result<(), ScanError>> {
    (0..n)
        .map(|_| Err(ScanError::InProgress("org.bluez.Error.InProgress".to_string())))
        .collect()
}

impl ScanFacility for FakeFacility {
    fn start(
        &mut self,
        events: mpsc::Sender<AdvertisementEvent>,
    ) -> BoxFuture<'_, Result<(), ScanError>> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        if self.hang_start {
            self.calls.active.store(true, Ordering::SeqCst);
            return Box::pin(std::future::pending());
        }
        let result = self.start_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.calls.active.store(true, Ordering::SeqCst);
            for event in &self.pushed {
                events.try_send(event.clone()).unwrap();
            }
        }
        Box::pin(async move { result })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        self.calls.active.store(false, Ordering::SeqCst);
        let result = match &self.stop_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        };
        Box::pin(async move { result })
    }

    fn discover_once(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<AdvertisementEvent>, ScanError>> {
        self.calls.sweeps.fetch_add(1, Ordering::SeqCst);
        let result = self.sweep_results.pop_front().unwrap_or(Ok(Vec::new()));
        Box::pin(async move {
            // A real sweep takes its whole timeout.
            tokio::time::sleep(timeout).await;
            result
        })
    }
}

/// Adapter reset that only counts invocations.
#[derive(Debug, Clone, Default)]
pub struct FakeReset {
    count: Arc<AtomicUsize>,
}

impl FakeReset {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl AdapterReset for FakeReset {
    fn reset(&self) -> BoxFuture<'_, ()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}
