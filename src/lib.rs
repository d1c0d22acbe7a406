//! `airstatus` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup and
//! process exit codes. The run loop lives in [`crate::app`] and the scan
//! lifecycle in [`crate::controller`], both testable with an injected
//! scanning facility.

pub mod advertisement;
pub mod app;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod logging;
pub mod mac_address;
pub mod output;
pub mod reset;
pub mod scanner;
pub mod status;
pub mod window;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{AdvertisementEvent, AdvertisementFilter};
pub use controller::{ControllerSettings, ScanController, ScanState};
pub use decoder::{DecodeError, decode_status};
pub use mac_address::MacAddress;
pub use output::OutputFormatter;
pub use output::json::JsonFormatter;
pub use scanner::{Backend, ScanError, ScanFacility};
pub use status::{DecodedStatus, Model, StatusReport};
pub use window::{BeaconObservation, BeaconWindow};
