//! Lane capacity configuration.

use std::str::FromStr;
use std::time::Duration;

use agential_core::defaults::*;
use agential_core::Lane;

use crate::backoff::RetryPolicy;

/// Parse an environment variable, falling back to `default` when unset or malformed.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Capacity limits for one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneConfig {
    pub lane: Lane,
    /// Pending jobs beyond this are rejected at submit.
    pub max_depth: usize,
    /// Admitted plus running jobs never exceed this.
    pub max_in_flight: usize,
    /// Pending longer than this is dead-lettered.
    pub ttl: Duration,
}

impl LaneConfig {
    pub fn default_for(lane: Lane) -> Self {
        let (max_depth, max_in_flight, ttl_secs) = match lane {
            Lane::Hot => (LANE_HOT_MAX_DEPTH, LANE_HOT_MAX_IN_FLIGHT, LANE_HOT_TTL_SECS),
            Lane::VlmOcr => (
                LANE_VLM_OCR_MAX_DEPTH,
                LANE_VLM_OCR_MAX_IN_FLIGHT,
                LANE_VLM_OCR_TTL_SECS,
            ),
            Lane::Maintenance => (
                LANE_MAINTENANCE_MAX_DEPTH,
                LANE_MAINTENANCE_MAX_IN_FLIGHT,
                LANE_MAINTENANCE_TTL_SECS,
            ),
            Lane::Backfill => (
                LANE_BACKFILL_MAX_DEPTH,
                LANE_BACKFILL_MAX_IN_FLIGHT,
                LANE_BACKFILL_TTL_SECS,
            ),
        };
        Self {
            lane,
            max_depth,
            max_in_flight,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Read `LANE_<NAME>_MAX_DEPTH`, `LANE_<NAME>_MAX_IN_FLIGHT` and
    /// `LANE_<NAME>_TTL_SECS`, e.g. `LANE_VLM_OCR_MAX_DEPTH`.
    pub fn from_env(lane: Lane) -> Self {
        let defaults = Self::default_for(lane);
        let prefix = format!("LANE_{}", lane.as_str().to_uppercase());
        Self {
            lane,
            max_depth: env_or(&format!("{}_MAX_DEPTH", prefix), defaults.max_depth),
            max_in_flight: env_or(&format!("{}_MAX_IN_FLIGHT", prefix), defaults.max_in_flight)
                .max(1),
            ttl: Duration::from_secs(env_or(
                &format!("{}_TTL_SECS", prefix),
                defaults.ttl.as_secs(),
            )),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// At least one slot; a zero-slot lane could never dispatch.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Scheduler configuration: one entry per lane plus the retry policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    lanes: [LaneConfig; 4],
    pub retry: RetryPolicy,
    /// Applied to submissions that carry no attempt limit of their own.
    pub max_attempts: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lanes: Lane::ALL.map(LaneConfig::default_for),
            retry: RetryPolicy::default(),
            max_attempts: JOB_MAX_ATTEMPTS,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            lanes: Lane::ALL.map(LaneConfig::from_env),
            retry: RetryPolicy::from_env(),
            max_attempts: env_or("JOB_MAX_ATTEMPTS", JOB_MAX_ATTEMPTS).max(1),
        }
    }

    pub fn lane(&self, lane: Lane) -> &LaneConfig {
        &self.lanes[lane.index()]
    }

    /// Replace one lane's limits.
    pub fn with_lane(mut self, config: LaneConfig) -> Self {
        let idx = config.lane.index();
        self.lanes[idx] = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub(crate) fn into_lanes(self) -> [LaneConfig; 4] {
        self.lanes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_lane() {
        let config = SchedulerConfig::default();
        assert_eq!(config.lane(Lane::VlmOcr).max_depth, 100);
        assert_eq!(config.lane(Lane::Hot).max_in_flight, 8);
        assert_eq!(config.lane(Lane::Backfill).ttl, Duration::from_secs(86_400));
        for lane in Lane::ALL {
            assert_eq!(config.lane(lane).lane, lane);
        }
    }

    #[test]
    fn test_with_lane_replaces_only_that_lane() {
        let config = SchedulerConfig::default()
            .with_lane(LaneConfig::default_for(Lane::Maintenance).with_max_in_flight(5));
        assert_eq!(config.lane(Lane::Maintenance).max_in_flight, 5);
        assert_eq!(config.lane(Lane::Hot).max_in_flight, LANE_HOT_MAX_IN_FLIGHT);
    }

    #[test]
    fn test_max_in_flight_floor() {
        let config = LaneConfig::default_for(Lane::Hot).with_max_in_flight(0);
        assert_eq!(config.max_in_flight, 1);
    }

    #[test]
    fn test_max_attempts_floor() {
        assert_eq!(SchedulerConfig::default().max_attempts, JOB_MAX_ATTEMPTS);
        assert_eq!(SchedulerConfig::default().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("AGENTIAL_TEST_UNSET_VARIABLE", 7usize), 7);
    }
}
