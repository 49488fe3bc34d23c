//! Error types for the charm controller

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`).
/// This is idiomatic for error enums and improves readability at call sites.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Pebble API error: {0}")]
    PebbleError(#[from] crate::pebble::ClientError),

    #[error("State store error: {0}")]
    StateError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Check whether a Kubernetes API error is a permission denial.
///
/// Forbidden responses are never fatal here: they surface as a boolean so the
/// caller can move to a waiting status and defer the event.
pub fn is_forbidden(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 403)
}

/// Check whether a Kubernetes API error is a missing object.
///
/// Not-found responses on delete-before-recreate are swallowed by callers.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

/// Exponential backoff configuration for deferred-event redelivery
///
/// Handlers never retry; they defer the whole event and the dispatcher
/// redelivers it on this schedule.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for the first redelivery
    pub initial_delay: Duration,
    /// Maximum delay between redeliveries
    pub max_delay: Duration,
    /// Multiplier for each subsequent redelivery
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the redelivery delay for a given attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        // Apply jitter
        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}
