//! Scan lifecycle: start with retries, adapter recovery, polling fallback and
//! the per-tick status report.
//!
//! Events from either ingestion path go through [`ScanController::ingest`]
//! into the same window, and every report is built by
//! [`ScanController::report`].

use crate::advertisement::{AdvertisementEvent, AdvertisementFilter};
use crate::decoder::{STATUS_PAYLOAD_HEX_LEN, decode_status};
use crate::reset::AdapterReset;
use crate::scanner::{ScanError, ScanFacility};
use crate::status::StatusReport;
use crate::window::{BeaconWindow, DEFAULT_HORIZON};
use chrono::Local;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Starting,
    EventDriven,
    RecoveringAdapter,
    Polling,
    Stopped,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Starting => "starting",
            ScanState::EventDriven => "event-driven",
            ScanState::RecoveringAdapter => "recovering adapter",
            ScanState::Polling => "polling",
            ScanState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Timing and limits for the lifecycle.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Start attempts before falling back to polling.
    pub max_start_attempts: u32,
    /// Wait after an adapter reset before the next start attempt.
    pub settle_delay: Duration,
    /// Duration of one polling sweep.
    pub discover_timeout: Duration,
    /// Wait after a polling sweep hit "in progress".
    pub discover_backoff: Duration,
    /// Payload length (hex digits) handed to the decoder.
    pub expected_hex_len: usize,
    /// Age limit of window entries.
    pub horizon: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            max_start_attempts: 6,
            settle_delay: Duration::from_secs(1),
            discover_timeout: Duration::from_secs(3),
            discover_backoff: Duration::from_secs(1),
            expected_hex_len: STATUS_PAYLOAD_HEX_LEN,
            horizon: DEFAULT_HORIZON,
        }
    }
}

pub struct ScanController {
    facility: Box<dyn ScanFacility>,
    reset: Box<dyn AdapterReset>,
    filter: AdvertisementFilter,
    window: BeaconWindow,
    settings: ControllerSettings,
    state: ScanState,
    start_failures: u32,
}

impl ScanController {
    pub fn new(
        facility: Box<dyn ScanFacility>,
        reset: Box<dyn AdapterReset>,
        filter: AdvertisementFilter,
        settings: ControllerSettings,
    ) -> Self {
        ScanController {
            facility,
            reset,
            filter,
            window: BeaconWindow::new(settings.horizon),
            settings,
            state: ScanState::Starting,
            start_failures: 0,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Consecutive "in progress" start failures so far.
    pub fn start_failures(&self) -> u32 {
        self.start_failures
    }

    pub fn window(&self) -> &BeaconWindow {
        &self.window
    }

    fn enter(&mut self, state: ScanState) {
        debug!(from = %self.state, to = %state, "scan state change");
        self.state = state;
    }

    /// Bring scanning up, resolving to [`ScanState::EventDriven`] or
    /// [`ScanState::Polling`].
    ///
    /// Events are delivered to `events` once event-driven scanning runs; feed
    /// them back through [`ingest`](Self::ingest). Only the first call does
    /// anything; later calls return the current state.
    ///
    /// # Errors
    /// Any start failure other than "in progress". Scanning is stopped and the
    /// controller is left in [`ScanState::Stopped`].
    pub async fn start(
        &mut self,
        events: &mpsc::Sender<AdvertisementEvent>,
    ) -> Result<ScanState, ScanError> {
        while self.state == ScanState::Starting {
            debug!(attempt = self.start_failures + 1, "starting scan");

            match self.facility.start(events.clone()).await {
                Ok(()) => {
                    self.enter(ScanState::EventDriven);
                    info!("scanning for advertisements");
                }
                Err(err) if err.is_in_progress() => {
                    self.start_failures += 1;
                    debug!(attempt = self.start_failures, %err, "scan start contended");

                    if self.start_failures >= self.settings.max_start_attempts {
                        warn!(
                            attempts = self.start_failures,
                            "giving up on event-driven scanning, falling back to polling"
                        );
                        self.enter(ScanState::Polling);
                    } else {
                        self.enter(ScanState::RecoveringAdapter);
                        info!("resetting adapter");
                        self.reset.reset().await;
                        tokio::time::sleep(self.settings.settle_delay).await;
                        self.enter(ScanState::Starting);
                    }
                }
                Err(err) => {
                    self.halt().await;
                    return Err(err);
                }
            }
        }

        Ok(self.state)
    }

    /// Run an advertisement through the filter and keep it if it qualifies.
    pub fn ingest(&mut self, event: &AdvertisementEvent) {
        if let Some(observation) = self.filter.observe(event) {
            self.window.insert(observation);
        }
    }

    /// Produce this tick's report.
    ///
    /// While polling, a discovery sweep runs first. `Ok(None)` means the tick
    /// is skipped: the sweep was contended, or the controller has stopped.
    ///
    /// # Errors
    /// A polling sweep failure other than "in progress"; scanning is stopped.
    pub async fn tick(&mut self) -> Result<Option<StatusReport>, ScanError> {
        match self.state {
            ScanState::Stopped => return Ok(None),
            ScanState::Polling => {
                match self
                    .facility
                    .discover_once(self.settings.discover_timeout)
                    .await
                {
                    Ok(found) => {
                        debug!(devices = found.len(), "discovery sweep finished");
                        for event in &found {
                            self.ingest(event);
                        }
                    }
                    Err(err) if err.is_in_progress() => {
                        debug!(%err, "discovery sweep contended, backing off");
                        tokio::time::sleep(self.settings.discover_backoff).await;
                        return Ok(None);
                    }
                    Err(err) => {
                        self.halt().await;
                        return Err(err);
                    }
                }
            }
            _ => {}
        }

        Ok(Some(self.report()))
    }

    /// Report on the strongest device currently in the window.
    pub fn report(&mut self) -> StatusReport {
        let Some(strongest) = self.window.strongest() else {
            return StatusReport::not_found();
        };

        match strongest.manufacturer_payload.as_deref() {
            Some(payload) if payload.len() == self.settings.expected_hex_len => {
                match decode_status(payload) {
                    Ok(status) => StatusReport::from(&status),
                    Err(err) => {
                        debug!(%err, "undecodable status payload");
                        StatusReport::degraded(&strongest, Local::now())
                    }
                }
            }
            _ => StatusReport::degraded(&strongest, Local::now()),
        }
    }

    /// Stop scanning. Errors from the facility are logged and dropped.
    pub async fn shutdown(&mut self) {
        if self.state != ScanState::Stopped {
            self.halt().await;
        }
    }

    async fn halt(&mut self) {
        if let Err(err) = self.facility.stop().await {
            debug!(%err, "ignoring error while stopping scan");
        }
        self.enter(ScanState::Stopped);
        info!("scanning stopped");
    }
}
