//! # pwakit common
//!
//! Utilities shared by the cache controller, the page coordinator and the
//! `pwakit` binary.
//!
//! - Logging configuration and setup
//! - Bounded-time execution of network operations
//! - Wall-clock helpers for cache timestamps

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::{with_timeout, TimedOut};

/// Milliseconds since the Unix epoch.
///
/// Falls back to zero if the system clock is set before 1970.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
