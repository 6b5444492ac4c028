//! Result of one poll cycle.

use std::fmt;

/// A reading from the Geiger counter.
///
/// `Reading::default()` is an offline reading. Values of fetches that failed during the cycle are left at zero (or empty
/// for the version) and `is_online` is false.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    /// Device temperature in Celsius
    pub temperature: f64,
    /// Counts per minute
    pub cpm: u16,
    /// Model and firmware version, padding trimmed
    pub version: String,
    /// False if any fetch failed during this cycle
    pub is_online: bool,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} °C, {} CPM, {} (online: {})",
            self.temperature, self.cpm, self.version, self.is_online
        )
    }
}

/// Strip the NUL and space padding some firmwares append to `GETVER`.
pub fn trim_version(raw: &str) -> &str {
    raw.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}
