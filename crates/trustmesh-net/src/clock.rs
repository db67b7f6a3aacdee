//! Microsecond wall clock.
//!
//! Probe and datagram payloads carry absolute send times; the peer
//! echoes them untouched, so only the sender's clock is ever compared
//! against itself.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
pub fn micros_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
