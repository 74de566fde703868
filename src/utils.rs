//! Shared utility functions used across the crate.

use std::time::Duration;

/// Parse a duration string (e.g., "30s", "500ms", "1m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed or is negative.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        from_secs_f64(secs, 1.0)
    } else if let Some(mins) = s.strip_suffix('m') {
        from_secs_f64(mins, 60.0)
    } else if let Some(hours) = s.strip_suffix('h') {
        from_secs_f64(hours, 3600.0)
    } else {
        s.parse::<u64>().ok().map(Duration::from_millis)
    }
}

fn from_secs_f64(number: &str, scale: f64) -> Option<Duration> {
    let value = number.trim().parse::<f64>().ok()?;
    // try_from_secs_f64 rejects negative, NaN and overflowing values
    Duration::try_from_secs_f64(value * scale).ok()
}

/// Milliseconds as a float, the unit every latency metric is reported in.
pub fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
