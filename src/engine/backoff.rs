use std::time::Duration;

use crate::config::{RETRY_BASE_MS, RETRY_GROWTH, RETRY_MAX_MS};

/// Delay before the automatic retry that follows `consecutive_failures` failures.
///
/// `min(BASE * GROWTH^(n-1), MAX)`; zero failures is treated like one.
pub fn retry_delay(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(32) as i32;
    let ms = (RETRY_BASE_MS as f64 * RETRY_GROWTH.powi(exponent)).min(RETRY_MAX_MS as f64);
    Duration::from_secs_f64(ms / 1000.0)
}

/// Whole seconds shown to the user for a countdown, rounded up.
pub fn countdown_secs(delay: Duration) -> u64 {
    let ms = delay.as_millis() as u64;
    (ms + 999) / 1000
}
