// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Backend calls (Redis commands, index requests, event publishing) go through
//! [`retry`] so transient failures are absorbed close to where they happen.
//!
//! # Example
//!
//! ```
//! use plan_sync::resilience::retry::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! assert_eq!(RetryConfig::startup().max_retries, Some(5));
//!
//! // Daemon: never give up on reconnection
//! assert_eq!(RetryConfig::daemon().max_retries, None);
//!
//! // Query: quick retry, then fail
//! assert_eq!(RetryConfig::query().max_retries, Some(3));
//!
//! // Once: a single attempt, no backoff
//! assert_eq!(RetryConfig::once().max_retries, Some(1));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// `max_retries` counts total attempts; `None` retries forever.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// 5 attempts, failing after a few seconds, so bad configuration surfaces quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite retry for the long-running worker's reconnection path.
    /// Backoff is capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Quick retry for individual commands: 3 attempts, then the caller handles it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single attempt.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_retries: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Minimal delays, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay to wait after the given (1-indexed) failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        delay
    }
}

/// Retry every error until the attempt budget runs out.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Retry only errors `is_transient` accepts; anything else is returned at once.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) => {
                attempts += 1;
                let delay = config.delay_for_attempt(attempts);

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = max,
                        error = %err,
                        next_retry = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_retry = ?delay,
                        "Operation failed, will retry forever"
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
