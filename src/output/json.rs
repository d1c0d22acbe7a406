//! Compact JSON output, one object per line.

use crate::output::{OutputError, OutputFormatter};
use crate::status::StatusReport;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl JsonFormatter {
    pub fn new() -> Self {
        JsonFormatter
    }
}

impl OutputFormatter for JsonFormatter {
    fn format(&self, report: &StatusReport) -> Result<String, OutputError> {
        Ok(serde_json::to_string(report)?)
    }
}
