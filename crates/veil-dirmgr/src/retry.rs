//! Retry state for failed downloads, and the delay schedule behind it.
//!
//! Every downloadable resource carries a [`DownloadStatus`]: a count of
//! consecutive failures and the earliest time at which another attempt
//! is allowed.  Delays come from a decorrelated-jitter schedule, so
//! that a crowd of failing clients does not re-converge on the same
//! instant and hammer the authorities.

use std::num::{NonZeroU32, NonZeroU8};
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Deserialize;

use crate::CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES;

/// Lowest permitted base delay, in milliseconds.
const MIN_LOW_BOUND: u32 = 1000;

/// Largest permitted base delay, in milliseconds.
const MAX_LOW_BOUND: u32 = u32::MAX - 1;

/// Maximum amount to multiply the previous delay by.
const MAX_DELAY_MULT: u32 = 3;

/// A randomized backoff schedule for retrying a failing operation.
///
/// Each delay is drawn uniformly between the base delay and three times
/// the previous delay, so waits grow on average but keep a chance of
/// retrying promptly.
#[derive(Clone, Debug)]
pub struct RetryDelay {
    /// The last delay this schedule returned (in msec), or 0 if it has
    /// never returned one.
    last_delay_ms: u32,
    /// The lowest allowable delay (in msec).
    low_bound_ms: u32,
}

impl RetryDelay {
    /// Construct a new RetryDelay from a base delay in milliseconds.
    ///
    /// Base delays under one second are raised to one second.
    pub fn from_msec(base_delay_msec: u32) -> Self {
        let low_bound_ms = base_delay_msec.clamp(MIN_LOW_BOUND, MAX_LOW_BOUND);
        RetryDelay {
            last_delay_ms: 0,
            low_bound_ms,
        }
    }

    /// Construct a new RetryDelay from a base delay.
    pub fn from_duration(d: Duration) -> Self {
        let msec = d.as_millis();
        let msec = std::cmp::min(msec, u128::from(MAX_LOW_BOUND)) as u32;
        RetryDelay::from_msec(msec)
    }

    /// Helper: return a lower and upper bound for the next delay, in
    /// milliseconds.  Guarantees `low < high`.
    fn delay_bounds(&self) -> (u32, u32) {
        let low = self.low_bound_ms;
        let high = std::cmp::max(
            // low is at most MAX_LOW_BOUND, so low + 1 cannot overflow.
            low + 1,
            self.last_delay_ms.saturating_mul(MAX_DELAY_MULT),
        );
        (low, high)
    }

    /// Return the next delay to be used, according to a given random
    /// number generator.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let (low, high) = self.delay_bounds();
        let val = rng.gen_range(low..high);
        self.last_delay_ms = val;
        Duration::from_millis(u64::from(val))
    }

    /// Return this schedule to its original state.
    pub fn reset(&mut self) {
        self.last_delay_ms = 0;
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::from_msec(0)
    }
}

/// Configuration for how many times to retry a download, with what
/// frequency.
#[derive(Debug, Copy, Clone, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DownloadSchedule {
    /// How many attempts to make before the backoff plateaus.
    num_retries: NonZeroU32,

    /// The amount of time to delay after the first failure, and a
    /// lower bound for future delays.
    #[serde(with = "humantime_serde")]
    initial_delay: Duration,

    /// When downloading a batch of these, how many requests may be
    /// outstanding at once?
    #[serde(default = "default_parallelism")]
    parallelism: NonZeroU8,
}

/// Return the default parallelism for a DownloadSchedule.
fn default_parallelism() -> NonZeroU8 {
    #![allow(clippy::unwrap_used)]
    1.try_into().unwrap()
}

impl Default for DownloadSchedule {
    fn default() -> Self {
        DownloadSchedule::new(
            CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES,
            Duration::from_millis(1000),
            1,
        )
    }
}

impl DownloadSchedule {
    /// Create a new DownloadSchedule.
    ///
    /// The schedule will always permit at least one attempt; zero values
    /// for `attempts` and `parallelism` are remapped to one.
    pub fn new(attempts: u32, initial_delay: Duration, parallelism: u8) -> Self {
        // If unwrapping `1.try_into()` is not safe there are bigger problems
        #![allow(clippy::unwrap_used)]
        let num_retries = attempts
            .try_into()
            .unwrap_or_else(|_| 1.try_into().unwrap());
        let parallelism = parallelism
            .try_into()
            .unwrap_or_else(|_| 1.try_into().unwrap());
        DownloadSchedule {
            num_retries,
            initial_delay,
            parallelism,
        }
    }

    /// Return the number of attempts after which the backoff plateaus.
    pub fn n_attempts(&self) -> u32 {
        self.num_retries.into()
    }

    /// Return the number of parallel requests to launch for a batch.
    pub fn parallelism(&self) -> u8 {
        self.parallelism.into()
    }

    /// Return a fresh RetryDelay for this schedule.
    pub fn schedule(&self) -> RetryDelay {
        RetryDelay::from_duration(self.initial_delay)
    }
}

/// Retry state for a single downloadable resource.
#[derive(Clone, Debug)]
pub struct DownloadStatus {
    /// How many consecutive attempts have failed.
    n_failures: u32,
    /// Earliest time at which another attempt is allowed.
    next_attempt: SystemTime,
    /// The delay schedule driving `next_attempt`.
    delay: RetryDelay,
    /// The last delay we computed, reused once the schedule plateaus.
    last_delay: Duration,
    /// Failure count after which the delay stops growing.
    max_tries: u32,
}

impl DownloadStatus {
    /// Construct a download status that is ready immediately and
    /// plateaus after `schedule.n_attempts()` failures.
    pub fn from_schedule(schedule: &DownloadSchedule) -> Self {
        DownloadStatus {
            n_failures: 0,
            next_attempt: SystemTime::UNIX_EPOCH,
            delay: schedule.schedule(),
            last_delay: Duration::ZERO,
            max_tries: schedule.n_attempts(),
        }
    }

    /// Return true if an attempt is permitted at `now`.
    pub fn is_ready(&self, now: SystemTime) -> bool {
        self.next_attempt <= now
    }

    /// Return the number of consecutive failures recorded.
    pub fn n_failures(&self) -> u32 {
        self.n_failures
    }

    /// Return the earliest time at which another attempt is allowed.
    pub fn next_attempt(&self) -> SystemTime {
        self.next_attempt
    }

    /// Record a failed attempt at `now`, pushing the next permitted
    /// attempt into the future.
    ///
    /// After `max_tries` consecutive failures the delay plateaus at its
    /// last value instead of growing further.
    pub fn note_failure<R: Rng>(&mut self, now: SystemTime, rng: &mut R) {
        self.n_failures = self.n_failures.saturating_add(1);
        if self.n_failures <= self.max_tries || self.last_delay.is_zero() {
            self.last_delay = self.delay.next_delay(rng);
        }
        self.next_attempt = now + self.last_delay;
    }

    /// Record a successful attempt, resetting the failure count and
    /// making the next attempt permitted immediately.
    pub fn note_success(&mut self) {
        self.n_failures = 0;
        self.next_attempt = SystemTime::UNIX_EPOCH;
        self.delay.reset();
        self.last_delay = Duration::ZERO;
    }
}

impl Default for DownloadStatus {
    fn default() -> Self {
        DownloadStatus::from_schedule(&DownloadSchedule::default())
    }
}
