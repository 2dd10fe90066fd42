use std::thread;
use std::time::Duration;

use log::warn;

use super::backend::BackendError;
use crate::config::RetryConfig;

/// Exponential backoff for transient backend errors. Errors that are not
/// transient (syntax, duplicate column, constraint violations) are returned
/// on the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_factor: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Result<T, BackendError>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "Transient failure on {}: {}, retrying in {}ms ({}/{})",
                        what,
                        e,
                        delay.as_millis(),
                        attempt,
                        self.max_attempts - 1
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
