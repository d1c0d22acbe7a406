//! Value parsers and defaults for command-line / environment configuration.

use std::time::Duration;

/// Local names that identify earbuds when no manufacturer data is present.
pub const DEFAULT_NAME_HINTS: &[&str] = &[
    "AirPods",
    "AirPods Pro",
    "AirPods Pro 2",
    "AirPods3",
    "AirPods Max",
];

/// The default name hints as owned strings.
pub fn default_name_hints() -> Vec<String> {
    DEFAULT_NAME_HINTS.iter().map(|s| s.to_string()).collect()
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds, fractions allowed (`0.5`, `1.5s`)
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use airstatus::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1").unwrap(), Duration::from_secs(1));
/// assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    if let Some(num) = src.strip_suffix("ms") {
        let millis: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid milliseconds: {num}"))?;
        return Ok(Duration::from_millis(millis));
    }

    if let Some(num) = src.strip_suffix('h') {
        let hours: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid hours: {num}"))?;
        let secs = hours
            .checked_mul(3600)
            .ok_or_else(|| format!("duration too large: {src}"))?;
        return Ok(Duration::from_secs(secs));
    }

    if let Some(num) = src.strip_suffix('m') {
        let minutes: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid minutes: {num}"))?;
        let secs = minutes
            .checked_mul(60)
            .ok_or_else(|| format!("duration too large: {src}"))?;
        return Ok(Duration::from_secs(secs));
    }

    let num = src.strip_suffix('s').unwrap_or(src).trim();
    let secs: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid duration: {src}"))
}

/// Parse a tick interval, which must be non-zero.
pub fn parse_interval(src: &str) -> Result<Duration, String> {
    match parse_duration(src)? {
        Duration::ZERO => Err("interval must be greater than zero".to_string()),
        interval => Ok(interval),
    }
}

/// Parse a 16-bit company identifier given in decimal or `0x`-prefixed hex.
pub fn parse_manufacturer_id(src: &str) -> Result<u16, String> {
    let src = src.trim();
    let parsed = match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => src.parse(),
    };
    parsed.map_err(|_| format!("invalid manufacturer id: {src}"))
}
