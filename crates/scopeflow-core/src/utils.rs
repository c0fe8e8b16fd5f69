/*!
 * Utility functions and helpers for ScopeFlow.
 */
use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Run an operation, retrying it on failure
///
/// # Arguments
///
/// * `retries` - The number of retries after the first attempt
/// * `operation` - The operation to run; called at most `retries + 1` times
///
/// # Returns
///
/// The first successful result, or the error of the last attempt
pub fn with_retry<F, T, E>(retries: usize, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!("Attempt {} failed: {}", attempt, e);
                debug!("Retry {}/{}", attempt, retries);
            }
            Err(e) => {
                warn!("All {} attempts failed after {:?}: {}", attempt + 1, start.elapsed(), e);
                return Err(e);
            }
        }
    }
}

/// Convert a duration to milliseconds
pub fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Convert milliseconds to a duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
