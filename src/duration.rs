//! Human-readable durations for command-line and environment options.

use std::time::Duration;

/// Parse a duration such as `60`, `30s`, `2m`, `1h` or `500ms`.
///
/// A bare number is interpreted as seconds, so existing `POLLING_RATE=60`
/// style configuration keeps working.
///
/// # Examples
/// ```
/// use gmc_logger::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be tried before "m" and "s"
    let (number, unit, millis_per_unit) = if let Some(num) = src.strip_suffix("ms") {
        (num, "milliseconds", 1)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, "hours", 3_600_000)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, "minutes", 60_000)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, "seconds", 1000)
    } else {
        (src, "duration", 1000)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {number}"))?;
    Ok(Duration::from_millis(value.saturating_mul(millis_per_unit)))
}

/// Like [`parse_duration`], but rejects zero.
///
/// Used for the polling interval and the serial read timeout, where zero
/// would mean a busy loop or a read that never waits for the device.
pub fn parse_positive_duration(src: &str) -> Result<Duration, String> {
    let duration = parse_duration(src)?;
    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}
