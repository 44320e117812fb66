//! Retry with decorrelated-jitter backoff.
//!
//! Every remote call of the client runs through [`RetryExecutor`]. The delay
//! schedule is derived per invocation from `(max_attempts, total_timeout)`. It has
//! `max_attempts - 1` entries, the median of its first delay is
//! `total_timeout / 2^max_attempts`, and each entry grows from the previous one
//! with random jitter. Entries are clamped so the cumulative wait stays within
//! `total_timeout`, and each one is drawn only once a retry is actually due.

use metrics::counter;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GridError, Result};
use crate::telemetry::names;

/// Shape factor of the jitter curve.
const P_FACTOR: f64 = 4.0;

/// Rescales the curve so its median first value matches the target.
const RP_SCALING_FACTOR: f64 = 1.0 / 1.4;

/// Lower bound applied to every delay.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Outcome of classifying an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retry,
    Fatal,
}

/// Default classification of remote status codes.
pub fn classify_code(code: tonic::Code) -> Classification {
    use tonic::Code;

    match code {
        Code::InvalidArgument
        | Code::NotFound
        | Code::PermissionDenied
        | Code::Unauthenticated
        | Code::Unimplemented
        | Code::AlreadyExists => Classification::Fatal,
        Code::Ok
        | Code::Cancelled
        | Code::Unknown
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Internal
        | Code::Unavailable
        | Code::DataLoss => Classification::Retry,
    }
}

/// Default classification of runtime errors.
///
/// Transport and I/O failures are retried. Everything outside the status table
/// and the transient local errors is fatal.
pub fn classify_error(error: &GridError) -> Classification {
    match error {
        GridError::Rpc(status) => classify_code(status.code()),
        GridError::Io(_)
        | GridError::Connection(_)
        | GridError::Timeout(_)
        | GridError::ResultRejected(_) => Classification::Retry,
        _ => Classification::Fatal,
    }
}

/// Retry parameters of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts, first try included.
    pub max_attempts: u32,
    /// Time budget spread across the delays.
    pub total_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, total_timeout: Duration) -> Self {
        Self {
            max_attempts,
            total_timeout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GridError::Configuration(
                "max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.total_timeout.is_zero() {
            return Err(GridError::Configuration(
                "total_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Median of the first delay of the schedule.
    pub fn median_first_delay(&self) -> Duration {
        self.total_timeout
            .div_f64(2f64.powi(self.max_attempts.min(i32::MAX as u32) as i32))
    }

    /// Start a lazily drawn delay schedule.
    pub fn schedule(&self) -> Result<DelaySchedule> {
        self.validate()?;
        Ok(DelaySchedule {
            median: self.median_first_delay().as_secs_f64(),
            remaining: self.total_timeout.as_secs_f64(),
            previous: 0.0,
            drawn: 0,
            retries: self.max_attempts - 1,
        })
    }

    /// Draw a fresh delay schedule.
    pub fn delays(&self) -> Result<Vec<Duration>> {
        Ok(self.schedule()?.collect())
    }

    /// Draw a delay schedule from the given random source.
    pub fn delays_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<Duration>> {
        let mut schedule = self.schedule()?;
        Ok(std::iter::from_fn(|| schedule.next_with(rng)).collect())
    }
}

/// Delays of one retried invocation, drawn one at a time.
#[derive(Debug, Clone)]
pub struct DelaySchedule {
    median: f64,
    remaining: f64,
    previous: f64,
    drawn: u32,
    retries: u32,
}

impl DelaySchedule {
    /// Delays not drawn yet.
    pub fn remaining_retries(&self) -> u32 {
        self.retries - self.drawn
    }

    /// Draw the next delay, or `None` once every retry is spent.
    pub fn next_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.drawn >= self.retries {
            return None;
        }

        let t = self.drawn as f64 + rng.random::<f64>();
        let next = 2f64.powf(t) * (P_FACTOR * t).sqrt().tanh();
        let secs = ((next - self.previous) * RP_SCALING_FACTOR * self.median).min(self.remaining);
        let delay = Duration::from_secs_f64(secs.max(0.0)).max(MIN_DELAY);

        self.remaining = (self.remaining - delay.as_secs_f64()).max(0.0);
        self.previous = next;
        self.drawn += 1;
        Some(delay)
    }
}

impl Iterator for DelaySchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.next_with(&mut rand::rng())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.remaining_retries() as usize;
        (left, Some(left))
    }
}

/// Draw a delay schedule for `(max_attempts, total_timeout)`.
pub fn retry_delays(max_attempts: u32, total_timeout: Duration) -> Result<Vec<Duration>> {
    RetryPolicy::new(max_attempts, total_timeout).delays()
}

/// Replays fallible asynchronous operations according to a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `op` with the default classification, accepting any value.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(operation, cancel, classify_error, |_: &T| true, op)
            .await
    }

    /// Run `op` until it yields an accepted value, a fatal error, or the
    /// schedule runs out.
    ///
    /// A rejected value counts as a retryable failure. Exhaustion wraps the last
    /// cause in [`GridError::RetryExhausted`]. Fatal errors propagate unwrapped.
    pub async fn execute_with<T, F, Fut, C, A>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        classify: C,
        accept: A,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&GridError) -> Classification,
        A: Fn(&T) -> bool,
    {
        self.execute_observed(operation, cancel, classify, accept, |_, _| {}, op)
            .await
    }

    /// Like [`execute_with`](Self::execute_with), calling `on_retry` with the
    /// failed attempt number and its error each time another attempt is
    /// scheduled. It is not called for the final failure.
    pub async fn execute_observed<T, F, Fut, C, A, R>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        classify: C,
        accept: A,
        mut on_retry: R,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&GridError) -> Classification,
        A: Fn(&T) -> bool,
        R: FnMut(u32, &GridError),
    {
        let mut delays = self.policy.schedule()?;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(GridError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GridError::Cancelled),
                outcome = op(cancel.child_token()) => outcome,
            };

            let error = match outcome {
                Ok(value) if accept(&value) => return Ok(value),
                Ok(_) => GridError::ResultRejected(operation.to_string()),
                Err(GridError::Cancelled) => return Err(GridError::Cancelled),
                Err(error) => {
                    if classify(&error) == Classification::Fatal {
                        debug!(operation, attempt, error = %error, "Fatal error, not retrying");
                        return Err(error);
                    }
                    error
                }
            };

            let Some(delay) = delays.next() else {
                warn!(operation, attempts = attempt, error = %error, "Retry budget exhausted");
                return Err(GridError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            };

            warn!(operation, attempt, ?delay, error = %error, "Remote call failed, retrying");
            on_retry(attempt, &error);
            counter!(names::RETRY_ATTEMPTS, "operation" => operation.to_string()).increment(1);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GridError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
