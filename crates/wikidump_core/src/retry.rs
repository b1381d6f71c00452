use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::warn;

use crate::remote::RemoteError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MIN_BACKOFF_SECS: u64 = 2;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 10;

/// How many times a remote call is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_backoff: Duration::from_secs(DEFAULT_MIN_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    /// Policy used when pushing artifacts to the ingestion backend.
    pub fn upload_default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(40),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("retry max_attempts must be at least 1");
        }
        if self.min_backoff > self.max_backoff {
            bail!(
                "retry min_backoff ({}s) is larger than max_backoff ({}s)",
                self.min_backoff.as_secs_f64(),
                self.max_backoff.as_secs_f64()
            );
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-based): `min(max, min * 2^retry)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.min_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &mut S {
    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Run `operation`, retrying transient remote failures according to `policy`.
///
/// Permanent failures are returned immediately; once the attempt budget is
/// spent the last error is returned unchanged.
pub fn with_retry<T, S, F>(
    policy: &RetryPolicy,
    sleeper: &mut S,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    S: Sleeper + ?Sized,
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts || !is_transient(&error) {
                    return Err(error);
                }
                let delay = policy.backoff(attempt - 1);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %format!("{error:#}"),
                    "transient failure, retrying"
                );
                sleeper.sleep(delay);
            }
        }
    }
}

/// Collect up to `max_items` results from a `start`/`limit` style listing.
///
/// Each batch request goes through [`with_retry`]. Listing stops on the first
/// empty batch or once `max_items` have been collected.
pub fn paginate<T, S, F>(
    policy: &RetryPolicy,
    sleeper: &mut S,
    page_size: usize,
    max_items: usize,
    mut fetch: F,
) -> Result<Vec<T>>
where
    S: Sleeper + ?Sized,
    F: FnMut(usize, usize) -> Result<Vec<T>>,
{
    if page_size == 0 {
        bail!("page size must be greater than zero");
    }

    let mut items = Vec::new();
    while items.len() < max_items {
        let start = items.len();
        let batch = with_retry(policy, sleeper, "paginate", || fetch(start, page_size))?;
        if batch.is_empty() {
            break;
        }
        items.extend(batch);
    }
    items.truncate(max_items);
    Ok(items)
}

pub fn is_transient(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause
            .downcast_ref::<RemoteError>()
            .is_some_and(RemoteError::is_transient)
    })
}
