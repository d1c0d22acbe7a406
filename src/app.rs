//! Core application runner (business logic) for `airstatus`.
//!
//! This module is decoupled from CLI parsing and process exit codes so the
//! run loop can be driven in tests by a fake scanning facility and a paused clock.

use crate::advertisement::{AdvertisementFilter, DEFAULT_MIN_RSSI};
use crate::config::{default_name_hints, parse_interval, parse_manufacturer_id};
use crate::controller::{ControllerSettings, ScanController};
use crate::decoder::STATUS_PAYLOAD_HEX_LEN;
use crate::output::json::JsonFormatter;
use crate::output::{AppendFile, OutputError, OutputFormatter};
use crate::reset::CommandReset;
use crate::scanner::{self, Backend, EVENT_CHANNEL_BUFFER_SIZE, ScanError};
use crate::status::StatusReport;
use clap::{ArgAction, Parser, builder::BoolishValueParser};
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::pin::pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::info;

/// Print AirPods battery and charging status as JSON, one line per interval.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Time between status lines.
    /// Accepts seconds (1, 0.5, 2s) or a duration with suffix: 500ms, 1m.
    #[arg(long, env = "AIRSTATUS_UPDATE_SEC", default_value = "1", value_parser = parse_interval)]
    pub interval: Duration,

    /// Ignore advertisements weaker than this (dBm)
    #[arg(long, env = "AIRSTATUS_MIN_RSSI", default_value_t = DEFAULT_MIN_RSSI, allow_negative_numbers = true)]
    pub min_rssi: i16,

    /// Length in hex digits of a status payload the decoder accepts
    #[arg(long, env = "AIRSTATUS_HEX_LEN", default_value_t = STATUS_PAYLOAD_HEX_LEN)]
    pub hex_len: usize,

    /// Company identifier of the manufacturer data to look for (decimal or 0x hex)
    #[arg(long, env = "AIRSTATUS_MANUFACTURER_ID", default_value = "0x004C", value_parser = parse_manufacturer_id)]
    pub manufacturer_id: u16,

    /// Comma-separated device names that match even without manufacturer data
    #[arg(long, env = "AIRSTATUS_NAME_HINTS", value_delimiter = ',', default_values_t = default_name_hints())]
    pub name_hints: Vec<String>,

    /// Debug logging (qualifying advertisements, state changes)
    #[arg(
        short = 'v',
        long = "debug",
        env = "AIRSTATUS_DEBUG",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub debug: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, env = "AIRSTATUS_BACKEND", default_value_t, value_enum)]
    pub backend: Backend,

    /// Bluetooth adapter to scan with
    #[arg(long, env = "AIRSTATUS_ADAPTER", default_value = "hci0")]
    pub adapter: String,

    /// Append status lines to this file instead of printing them
    pub output: Option<PathBuf>,
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Output(#[from] OutputError),
}

fn write_report(
    formatter: &dyn OutputFormatter,
    report: &StatusReport,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    let mut line = formatter.format(report)?;
    line.push('\n');
    // Whole record in a single write.
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Drive `controller` until `shutdown` resolves, writing one line per tick to `out`.
///
/// The first tick happens one `interval` after scanning is up. Advertisements
/// pushed by the facility are ingested between ticks. The controller is always
/// stopped before returning.
pub async fn run_with_io(
    controller: &mut ScanController,
    interval: Duration,
    formatter: &dyn OutputFormatter,
    out: &mut dyn Write,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
    let mut shutdown = pin!(shutdown);

    let started = tokio::select! {
        _ = &mut shutdown => None,
        started = controller.start(&events_tx) => Some(started),
    };
    match started {
        Some(Ok(state)) => info!(mode = %state, "scan running"),
        Some(Err(err)) => return Err(err.into()),
        None => {
            controller.shutdown().await;
            return Ok(());
        }
    }

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break Ok(()),
            Some(event) = events_rx.recv() => controller.ingest(&event),
            _ = ticker.tick() => match controller.tick().await {
                Ok(Some(report)) => {
                    if let Err(err) = write_report(formatter, &report, out) {
                        break Err(err);
                    }
                }
                Ok(None) => {}
                Err(err) => break Err(err.into()),
            },
        }
    };

    controller.shutdown().await;
    result
}

/// Open the configured backend and run until `shutdown` resolves.
pub async fn run(options: Options, shutdown: impl Future<Output = ()>) -> Result<(), RunError> {
    info!(
        backend = %options.backend,
        adapter = %options.adapter,
        interval = ?options.interval,
        "starting"
    );

    let facility = scanner::open(options.backend, &options.adapter).await?;
    let filter = AdvertisementFilter::new(
        options.manufacturer_id,
        &options.name_hints,
        options.min_rssi,
    );
    let settings = ControllerSettings {
        expected_hex_len: options.hex_len,
        ..ControllerSettings::default()
    };
    let mut controller = ScanController::new(
        facility,
        Box::new(CommandReset::new(options.adapter.as_str())),
        filter,
        settings,
    );
    let formatter = JsonFormatter::new();

    match &options.output {
        Some(path) => {
            let mut out = AppendFile::new(path);
            run_with_io(&mut controller, options.interval, &formatter, &mut out, shutdown).await
        }
        None => {
            let mut out = io::stdout();
            run_with_io(&mut controller, options.interval, &formatter, &mut out, shutdown).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::APPLE_MANUFACTURER_ID;
    use crate::controller::ScanState;
    use crate::test_utils::{
        FakeFacility, FakeReset, advertisement, in_progress_failures, status_payload_bytes,
    };

    fn controller(facility: FakeFacility) -> ScanController {
        let filter = AdvertisementFilter::new(
            APPLE_MANUFACTURER_ID,
            &default_name_hints(),
            DEFAULT_MIN_RSSI,
        );
        ScanController::new(
            Box::new(facility),
            Box::new(FakeReset::default()),
            filter,
            ControllerSettings::default(),
        )
    }

    async fn run_for(
        controller: &mut ScanController,
        duration: Duration,
    ) -> (Result<(), RunError>, String) {
        let mut out = Vec::<u8>::new();
        let result = run_with_io(
            controller,
            Duration::from_secs(1),
            &JsonFormatter::new(),
            &mut out,
            tokio::time::sleep(duration),
        )
        .await;
        (result, String::from_utf8(out).unwrap())
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn options_defaults() {
        let options = Options::try_parse_from(["airstatus"]).unwrap();
        assert_eq!(options.interval, Duration::from_secs(1));
        assert_eq!(options.min_rssi, -90);
        assert_eq!(options.hex_len, 54);
        assert_eq!(options.manufacturer_id, 0x004C);
        assert_eq!(options.name_hints, default_name_hints());
        assert!(!options.debug);
        assert_eq!(options.backend, Backend::default());
        assert_eq!(options.adapter, "hci0");
        assert_eq!(options.output, None);
    }

    #[test]
    fn options_from_arguments() {
        let options = Options::try_parse_from([
            "airstatus",
            "--interval",
            "500ms",
            "--min-rssi",
            "-70",
            "--name-hints",
            "Beats,AirPods Max",
            "--manufacturer-id",
            "76",
            "-v",
            "/tmp/airstatus.out",
        ])
        .unwrap();

        assert_eq!(options.interval, Duration::from_millis(500));
        assert_eq!(options.min_rssi, -70);
        assert_eq!(options.name_hints, ["Beats", "AirPods Max"]);
        assert_eq!(options.manufacturer_id, 76);
        assert!(options.debug);
        assert_eq!(options.output, Some(PathBuf::from("/tmp/airstatus.out")));
    }

    #[test]
    fn options_reject_zero_interval() {
        assert!(Options::try_parse_from(["airstatus", "--interval", "0"]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_not_found_each_tick() {
        let mut controller = controller(FakeFacility::new());
        let (result, out) = run_for(&mut controller, Duration::from_millis(3500)).await;

        result.unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines
            .iter()
            .all(|line| *line == r#"{"status":0,"model":"AirPods not found"}"#));
        assert!(out.ends_with('\n'));
        assert_eq!(controller.state(), ScanState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ingests_pushed_advertisements() {
        let facility = FakeFacility::new().pushing(vec![advertisement(
            Some("AirPods Pro"),
            Some(-45),
            Some(status_payload_bytes('e', '2', '7', '9', '5', 'a')),
        )]);
        let calls = facility.calls();
        let mut controller = controller(facility);

        let (result, out) = run_for(&mut controller, Duration::from_millis(1500)).await;
        result.unwrap();

        let line: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(line["status"], 1);
        assert_eq!(line["charge"]["left"], 95);
        assert_eq!(line["charge"]["right"], 75);
        assert_eq!(line["charging_case"], true);
        assert_eq!(calls.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_degrades_unsupported_payload() {
        let facility = FakeFacility::new().pushing(vec![advertisement(
            Some("AirPods"),
            Some(-45),
            Some(vec![0x07, 0x19, 0x01]),
        )]);
        let mut controller = controller(facility);

        let (result, out) = run_for(&mut controller, Duration::from_millis(1500)).await;
        result.unwrap();

        let line: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(line["status"], 0);
        assert_eq!(line["model"], "AirPods detected");
        assert_eq!(
            line["note"],
            "Manufacturer frame present but unsupported length"
        );
        assert_eq!(line["rssi"], -45);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_after_start_budget_is_spent() {
        let facility = FakeFacility::new().with_start_results(in_progress_failures(6));
        let calls = facility.calls();
        let mut controller = controller(facility);

        // Five resets settle by 5s and the first tick at 6s sweeps until 9s;
        // the shutdown at 6.5s is seen once that tick has written its line.
        let (result, out) = run_for(&mut controller, Duration::from_millis(6500)).await;
        result.unwrap();

        assert_eq!(out.lines().count(), 1);
        assert_eq!(calls.starts(), 6);
        assert_eq!(calls.sweeps(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_fatal_start_error() {
        let facility = FakeFacility::new()
            .with_start_results(vec![Err(ScanError::Bluetooth("no adapter".to_string()))]);
        let mut controller = controller(facility);

        let (result, out) = run_for(&mut controller, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(RunError::Scan(ScanError::Bluetooth(_)))));
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_shutdown_during_start_stops_scanner() {
        let facility = FakeFacility::new().with_start_results(in_progress_failures(6));
        let calls = facility.calls();
        let mut controller = controller(facility);

        let (result, out) = run_for(&mut controller, Duration::from_millis(2500)).await;

        result.unwrap();
        assert!(out.is_empty());
        assert_eq!(calls.stops(), 1);
        assert_eq!(controller.state(), ScanState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn run_shutdown_while_start_is_pending_tears_down_session() {
        let facility = FakeFacility::new().hanging_start();
        let calls = facility.calls();
        let mut controller = controller(facility);

        let (result, out) = run_for(&mut controller, Duration::from_secs(5)).await;

        result.unwrap();
        assert!(out.is_empty());
        assert_eq!(calls.starts(), 1);
        assert_eq!(calls.stops(), 1);
        assert!(!calls.active());
        assert_eq!(controller.state(), ScanState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn run_fails_on_sink_error() {
        let mut controller = controller(FakeFacility::new());

        let result = run_with_io(
            &mut controller,
            Duration::from_secs(1),
            &JsonFormatter::new(),
            &mut BrokenPipe,
            tokio::time::sleep(Duration::from_secs(10)),
        )
        .await;

        assert!(matches!(result, Err(RunError::Io(_))));
        assert_eq!(controller.state(), ScanState::Stopped);
    }
}
