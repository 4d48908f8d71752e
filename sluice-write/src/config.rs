// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Write client configuration

use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;

const MAX_BATCH_ROWS: usize = 500;
const MAX_BATCH_BYTES: usize = 9 * 1024 * 1024;
const MAX_IN_FLIGHT_BATCHES: usize = 4;
const MAX_IN_FLIGHT_BYTES: usize = 64 * 1024 * 1024;
const MAX_APPEND_ATTEMPTS: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Limits and retry policy for a run, shared by every stream of a client
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    max_batch_rows: usize,
    max_batch_bytes: usize,
    max_in_flight_batches: usize,
    max_in_flight_bytes: usize,
    max_append_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    records_per_second: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_rows: MAX_BATCH_ROWS,
            max_batch_bytes: MAX_BATCH_BYTES,
            max_in_flight_batches: MAX_IN_FLIGHT_BATCHES,
            max_in_flight_bytes: MAX_IN_FLIGHT_BYTES,
            max_append_attempts: MAX_APPEND_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            records_per_second: None,
        }
    }
}

impl Config {
    pub fn with_max_batch_rows(self, max_batch_rows: usize) -> Self {
        Self {
            max_batch_rows: max_batch_rows.max(1),
            ..self
        }
    }

    pub fn with_max_batch_bytes(self, max_batch_bytes: usize) -> Self {
        Self {
            max_batch_bytes: max_batch_bytes.max(1),
            ..self
        }
    }

    pub fn with_max_in_flight_batches(self, max_in_flight_batches: usize) -> Self {
        Self {
            max_in_flight_batches: max_in_flight_batches.clamp(1, Semaphore::MAX_PERMITS),
            ..self
        }
    }

    pub fn with_max_in_flight_bytes(self, max_in_flight_bytes: usize) -> Self {
        Self {
            max_in_flight_bytes: max_in_flight_bytes.clamp(1, Semaphore::MAX_PERMITS),
            ..self
        }
    }

    pub fn with_max_append_attempts(self, max_append_attempts: u32) -> Self {
        Self {
            max_append_attempts: max_append_attempts.max(1),
            ..self
        }
    }

    pub fn with_backoff(self, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            ..self
        }
    }

    pub fn with_records_per_second(self, records_per_second: Option<u32>) -> Self {
        Self {
            records_per_second,
            ..self
        }
    }

    pub fn max_batch_rows(&self) -> usize {
        self.max_batch_rows
    }

    pub fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    pub fn max_in_flight_batches(&self) -> usize {
        self.max_in_flight_batches
    }

    pub fn max_in_flight_bytes(&self) -> usize {
        self.max_in_flight_bytes
    }

    pub fn max_append_attempts(&self) -> u32 {
        self.max_append_attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn records_per_second(&self) -> Option<u32> {
        self.records_per_second
    }

    /// Delay before retry `attempt` (zero based) with full jitter:
    /// uniform in `0..=min(max, initial * 2^attempt)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.initial_backoff.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(1u64 << attempt.min(20))
            .min(u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX));

        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(500, config.max_batch_rows());
        assert_eq!(9 * 1024 * 1024, config.max_batch_bytes());
        assert_eq!(4, config.max_in_flight_batches());
        assert_eq!(64 * 1024 * 1024, config.max_in_flight_bytes());
        assert_eq!(10, config.max_append_attempts());
        assert_eq!(None, config.records_per_second());
    }

    #[test]
    fn limits_are_at_least_one() {
        let config = Config::default()
            .with_max_batch_rows(0)
            .with_max_in_flight_batches(0)
            .with_max_append_attempts(0);

        assert_eq!(1, config.max_batch_rows());
        assert_eq!(1, config.max_in_flight_batches());
        assert_eq!(1, config.max_append_attempts());
    }

    #[test]
    fn in_flight_limits_fit_a_semaphore() {
        let config = Config::default()
            .with_max_in_flight_batches(usize::MAX)
            .with_max_in_flight_bytes(usize::MAX);

        assert_eq!(Semaphore::MAX_PERMITS, config.max_in_flight_batches());
        assert_eq!(Semaphore::MAX_PERMITS, config.max_in_flight_bytes());

        let limits = crate::Limits::from(&config);
        assert_eq!(Semaphore::MAX_PERMITS, limits.bytes.available_permits());
    }

    #[test]
    fn backoff_is_capped() {
        let config = Config::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50));

        for attempt in 0..32 {
            let delay = config.backoff(attempt);
            assert!(delay <= Duration::from_millis(50), "{attempt}: {delay:?}");
        }

        assert!(config.backoff(0) <= Duration::from_millis(10));
    }
}
