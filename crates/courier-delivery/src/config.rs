//! Pipeline tuning and its safety bounds.
//!
//! Every knob is clamped before use so a bad configuration cannot produce a
//! busy loop or unbounded concurrency. The outbound lease is also raised to
//! cover the longest pacing wait plus one API call, so a row cannot be
//! reclaimed while its first claimant is still about to send it.

use std::time::Duration;

use tracing::warn;

use crate::retry::RetryPolicy;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_BATCH_SIZE: usize = 100;
const MIN_LEASE: Duration = Duration::from_secs(5);
const MAX_LEASE: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_ATTEMPTS: u32 = 50;
const MAX_CONCURRENCY: usize = 64;
const MAX_DESTINATION_INTERVAL: Duration = Duration::from_secs(60);
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_EXPONENT: u32 = 20;
const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Settings of one queue's worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Maximum rows per claim.
    pub batch_size: usize,
    /// Visibility lease granted by a claim.
    pub lease: Duration,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Maximum rows processed at once.
    pub max_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 20,
            lease: Duration::from_secs(60),
            max_attempts: 5,
            max_concurrency: 8,
        }
    }
}

impl WorkerConfig {
    /// Returns a copy with every value inside its bounds.
    pub fn clamped(&self, queue: &str) -> Self {
        Self {
            poll_interval: clamp_logged(
                queue,
                "poll_interval",
                self.poll_interval,
                MIN_POLL_INTERVAL,
                Duration::MAX,
            ),
            batch_size: clamp_logged(queue, "batch_size", self.batch_size, 1, MAX_BATCH_SIZE),
            lease: clamp_logged(queue, "lease", self.lease, MIN_LEASE, MAX_LEASE),
            max_attempts: clamp_logged(queue, "max_attempts", self.max_attempts, 1, MAX_ATTEMPTS),
            max_concurrency: clamp_logged(
                queue,
                "max_concurrency",
                self.max_concurrency,
                1,
                MAX_CONCURRENCY,
            ),
        }
    }

    /// Lease as a chrono duration for timestamp arithmetic.
    pub fn lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX)
    }
}

/// Settings of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Inbound worker loop.
    pub inbound: WorkerConfig,
    /// Outbound worker loop.
    pub outbound: WorkerConfig,
    /// Backoff for both queues.
    pub retry: RetryPolicy,
    /// Minimum interval between paced sends to one destination.
    pub destination_interval: Duration,
    /// How long shutdown waits for in-flight work.
    pub shutdown_timeout: Duration,
    /// Upper bound of one outbound API call, normally the HTTP client
    /// timeout.
    pub call_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inbound: WorkerConfig::default(),
            outbound: WorkerConfig { lease: Duration::from_secs(120), ..WorkerConfig::default() },
            retry: RetryPolicy::default(),
            destination_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    /// Returns a copy with every value inside its bounds, logging each
    /// adjustment.
    pub fn clamped(&self) -> Self {
        let min_backoff = clamp_logged(
            "retry",
            "min_backoff",
            self.retry.min_backoff,
            MIN_BACKOFF,
            Duration::MAX,
        );
        let max_backoff =
            clamp_logged("retry", "max_backoff", self.retry.max_backoff, min_backoff, Duration::MAX);
        let max_exponent =
            clamp_logged("retry", "max_exponent", self.retry.max_exponent, 0, MAX_EXPONENT);

        let destination_interval = clamp_logged(
            "outbound",
            "destination_interval",
            self.destination_interval,
            Duration::ZERO,
            MAX_DESTINATION_INTERVAL,
        );
        let call_timeout = clamp_logged(
            "outbound",
            "call_timeout",
            self.call_timeout,
            Duration::ZERO,
            MAX_CALL_TIMEOUT,
        );

        let mut outbound = self.outbound.clamped("outbound");
        let min_lease =
            outbound_lease_floor(outbound.max_concurrency, destination_interval, call_timeout);
        outbound.lease = clamp_logged("outbound", "lease", outbound.lease, min_lease, MAX_LEASE);

        Self {
            inbound: self.inbound.clamped("inbound"),
            outbound,
            retry: RetryPolicy { min_backoff, max_backoff, max_exponent },
            destination_interval,
            shutdown_timeout: self.shutdown_timeout,
            call_timeout,
        }
    }
}

/// Shortest outbound lease that outlives the worst pacing wait plus one call.
///
/// A row may queue behind every other in-flight row for the same
/// destination, one interval each, before its own call starts.
fn outbound_lease_floor(
    max_concurrency: usize,
    destination_interval: Duration,
    call_timeout: Duration,
) -> Duration {
    let slots = u32::try_from(max_concurrency).unwrap_or(u32::MAX);
    destination_interval
        .saturating_mul(slots)
        .saturating_add(call_timeout)
        .clamp(MIN_LEASE, MAX_LEASE)
}

fn clamp_logged<T>(scope: &str, field: &str, value: T, min: T, max: T) -> T
where
    T: Ord + Copy + std::fmt::Debug,
{
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!(scope, field, configured = ?value, using = ?clamped, "configuration value out of bounds");
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_within_bounds() {
        let config = PipelineConfig::default();
        assert_eq!(config.clamped(), config);
    }

    #[test]
    fn zero_values_are_raised() {
        let config = WorkerConfig {
            poll_interval: Duration::ZERO,
            batch_size: 0,
            lease: Duration::ZERO,
            max_attempts: 0,
            max_concurrency: 0,
        }
        .clamped("outbound");

        assert_eq!(config.poll_interval, MIN_POLL_INTERVAL);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.lease, MIN_LEASE);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn large_values_are_capped() {
        let config = PipelineConfig {
            inbound: WorkerConfig {
                batch_size: 10_000,
                max_attempts: 1_000,
                max_concurrency: 10_000,
                ..WorkerConfig::default()
            },
            destination_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::ZERO,
                max_exponent: 64,
            },
            ..PipelineConfig::default()
        }
        .clamped();

        assert_eq!(config.inbound.batch_size, MAX_BATCH_SIZE);
        assert_eq!(config.inbound.max_attempts, MAX_ATTEMPTS);
        assert_eq!(config.inbound.max_concurrency, MAX_CONCURRENCY);
        assert_eq!(config.destination_interval, MAX_DESTINATION_INTERVAL);
        assert_eq!(config.retry.min_backoff, MIN_BACKOFF);
        assert_eq!(config.retry.max_backoff, MIN_BACKOFF);
        assert_eq!(config.retry.max_exponent, MAX_EXPONENT);
    }

    #[test]
    fn outbound_lease_covers_pacing_and_one_call() {
        let config = PipelineConfig {
            outbound: WorkerConfig {
                lease: Duration::from_secs(5),
                max_concurrency: 8,
                batch_size: 10,
                ..WorkerConfig::default()
            },
            destination_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(60),
            ..PipelineConfig::default()
        }
        .clamped();

        assert_eq!(config.outbound.lease, Duration::from_secs(8 + 60));
        assert_eq!(config.inbound.lease, WorkerConfig::default().lease);
    }

    #[test]
    fn sufficient_outbound_lease_is_kept() {
        let config = PipelineConfig {
            outbound: WorkerConfig { lease: Duration::from_secs(600), ..WorkerConfig::default() },
            ..PipelineConfig::default()
        }
        .clamped();

        assert_eq!(config.outbound.lease, Duration::from_secs(600));
    }

    #[test]
    fn outbound_lease_floor_saturates_at_a_day() {
        let floor = outbound_lease_floor(64, MAX_DESTINATION_INTERVAL, MAX_CALL_TIMEOUT * 1000);
        assert_eq!(floor, MAX_LEASE);
    }

    #[test]
    fn huge_lease_is_capped_at_a_day() {
        let config = WorkerConfig { lease: Duration::MAX, ..WorkerConfig::default() }.clamped("inbound");
        assert_eq!(config.lease, MAX_LEASE);
        assert_eq!(config.lease_chrono(), chrono::Duration::hours(24));
    }
}
