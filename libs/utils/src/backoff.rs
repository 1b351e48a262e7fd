//! Retry loops used around flaky external operations.
//!
//! Package manager commands fail transiently while another process holds the
//! package database lock, which is common right after instance boot, so they
//! are retried with a fixed delay. Downloads and metadata refreshes are
//! retried with an exponential delay.
use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.5;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Delay {
    Fixed(Duration),
    Exponential { base_seconds: f64, max_seconds: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Delay,
}

impl RetryPolicy {
    /// Three attempts with exponential backoff, used for downloads.
    pub fn download() -> Self {
        Self {
            max_attempts: 3,
            delay: Delay::Exponential {
                base_seconds: DEFAULT_BASE_BACKOFF_SECONDS,
                max_seconds: DEFAULT_MAX_BACKOFF_SECONDS,
            },
        }
    }

    /// Five attempts five seconds apart, used for package manager commands.
    pub fn package_manager() -> Self {
        Self {
            max_attempts: 5,
            delay: Delay::Fixed(Duration::from_secs(5)),
        }
    }

    /// No sleeping between attempts. Tests only care about the attempt count.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Delay::Fixed(Duration::ZERO),
        }
    }

    /// How long to wait after the `n`th failed attempt (1-based).
    pub fn delay_after(&self, n: u32) -> Duration {
        match self.delay {
            Delay::Fixed(d) => d,
            Delay::Exponential {
                base_seconds,
                max_seconds,
            } => Duration::from_secs_f64(exponential_backoff_duration_seconds(
                n,
                base_seconds,
                max_seconds,
            )),
        }
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_seconds: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (base_seconds * 2f64.powf(f64::from(n - 1))).min(max_seconds)
    }
}

/// Retries `op` until it succeeds or `policy.max_attempts` is reached,
/// logging every failure. The last error is returned unchanged.
pub async fn retry<T, E, O, F>(policy: &RetryPolicy, description: &str, mut op: O) -> Result<T, E>
where
    // Not std::error::Error because anyhow::Error doesnt implement it.
    E: Display + Debug,
    O: FnMut() -> F,
    F: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => {
                if attempt > 1 {
                    tracing::info!("{description} succeeded after {attempt} attempts");
                }
                return Ok(v);
            }
            Err(err) if attempt < policy.max_attempts => {
                tracing::warn!("{description} failed, will retry (attempt {attempt}): {err:#}");
            }
            Err(err) => {
                tracing::warn!("{description} still failed after {attempt} attempts, giving up");
                return Err(err);
            }
        }
        let delay = policy.delay_after(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Blocking flavour of [`retry`], for operations that shell out.
pub fn retry_blocking<T, E, O>(policy: &RetryPolicy, description: &str, mut op: O) -> Result<T, E>
where
    E: Display + Debug,
    O: FnMut() -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => {
                if attempt > 1 {
                    tracing::info!("{description} succeeded after {attempt} attempts");
                }
                return Ok(v);
            }
            Err(err) if attempt < policy.max_attempts => {
                tracing::warn!("{description} failed, will retry (attempt {attempt}): {err:#}");
            }
            Err(err) => {
                tracing::warn!("{description} still failed after {attempt} attempts, giving up");
                return Err(err);
            }
        }
        let delay = policy.delay_after(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        attempt += 1;
    }
}
