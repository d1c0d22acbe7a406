//! BLE scanning facility abstraction.
//!
//! A facility delivers advertisement events either continuously, after
//! [`ScanFacility::start`], or as a single bounded sweep through
//! [`ScanFacility::discover_once`]. The controller decides which one to use.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::AdvertisementEvent;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Boxed future returned by facility and reset operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Channel buffer size for advertisement events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Error type for scanner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// The adapter is busy with another discovery session
    #[error("Operation already in progress: {0}")]
    InProgress(String),
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

impl ScanError {
    /// Whether this is the transient "operation in progress" contention.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ScanError::InProgress(_))
    }
}

/// A source of BLE advertisements.
///
/// Implementations push events into the sender given to `start` until
/// `stop` is called; `discover_once` must not be combined with a running
/// `start` session.
pub trait ScanFacility: Send {
    /// Begin continuous scanning, delivering every advertisement to `events`.
    fn start(
        &mut self,
        events: mpsc::Sender<AdvertisementEvent>,
    ) -> BoxFuture<'_, Result<(), ScanError>>;

    /// Stop a session started with `start`. Best effort.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>>;

    /// Scan for `timeout` and return what was seen, one event per device.
    fn discover_once(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<AdvertisementEvent>, ScanError>>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Open the scanning facility for `backend` on the named adapter (e.g. `hci0`).
pub async fn open(backend: Backend, adapter: &str) -> Result<Box<dyn ScanFacility>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerScanner::open(adapter).await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciScanner::open(adapter)?)),
    }
}

/// Parse the device index from an adapter name such as `hci0`.
pub fn adapter_index(adapter: &str) -> Result<u16, ScanError> {
    adapter
        .strip_prefix("hci")
        .unwrap_or(adapter)
        .parse()
        .map_err(|_| ScanError::Bluetooth(format!("invalid adapter name: {adapter}")))
}
