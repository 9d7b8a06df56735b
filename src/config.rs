//! Collector tunables (spec.md §6). All are advisory and overridable via
//! environment variables at collector start, following the teacher's
//! `NEPTUNE_THREADS` pattern in `gc.rs`.

use std::env;
use std::time::Duration;

use crate::error::GcError;

/// Fixed geometry constants. These are not tunable: spec.md §6 marks
/// `PageSize` and `PageCount/Block` as "Fixed".
pub const PAGE_SIZE: usize = 4096;
pub const PAGES_PER_BLOCK: usize = 15;
pub const MAX_TYPE_NUMBER: u32 = 64 * 64;

/// Runtime-tunable collector policy, read once when the collector thread is
/// started (spec.md §6 tunables table).
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Upper bound on collector idle time, in seconds.
    pub max_sleep_time_sec: u64,
    /// Allocation-vs-live ratio (percent) that wakes the collector early.
    pub trigger_percentage: u32,
    /// Floor of the wake trigger, in bytes.
    pub min_live_size: usize,
    /// Floor of the wake trigger, in object count.
    pub min_live_count: usize,
    /// Window, in bytes, used to classify a tracked-pointer cell's `this`
    /// address as stack-resident (spec.md §4.5).
    pub max_stack_offset: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            max_sleep_time_sec: 30,
            trigger_percentage: 25,
            min_live_size: PAGE_SIZE,
            min_live_count: 512,
            max_stack_offset: 1024,
        }
    }
}

impl GcConfig {
    /// Build a config from defaults, overridden by `CRUCIBLE_GC_*`
    /// environment variables where present.
    pub fn from_env() -> Result<Self, GcError> {
        let mut cfg = GcConfig::default();
        cfg.max_sleep_time_sec =
            env_override("CRUCIBLE_GC_MAX_SLEEP_TIME_SEC", cfg.max_sleep_time_sec)?;
        cfg.trigger_percentage =
            env_override("CRUCIBLE_GC_TRIGGER_PERCENTAGE", cfg.trigger_percentage)?;
        cfg.min_live_size = env_override("CRUCIBLE_GC_MIN_LIVE_SIZE", cfg.min_live_size)?;
        cfg.min_live_count = env_override("CRUCIBLE_GC_MIN_LIVE_COUNT", cfg.min_live_count)?;
        cfg.max_stack_offset =
            env_override("CRUCIBLE_GC_MAX_STACK_OFFSET", cfg.max_stack_offset)?;
        Ok(cfg)
    }

    pub fn max_sleep_time(&self) -> Duration {
        Duration::from_secs(self.max_sleep_time_sec)
    }
}

fn env_override<T>(name: &'static str, default: T) -> Result<T, GcError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    match env::var(name) {
        Ok(value) => value.parse().map_err(|source| GcError::Config {
            name,
            value,
            source,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = GcConfig::default();
        assert_eq!(cfg.max_sleep_time_sec, 30);
        assert_eq!(cfg.trigger_percentage, 25);
        assert_eq!(cfg.min_live_size, PAGE_SIZE);
        assert_eq!(cfg.min_live_count, 512);
        assert_eq!(cfg.max_stack_offset, 1024);
    }

    #[test]
    fn env_override_parses_valid_value() {
        env::set_var("CRUCIBLE_GC_TEST_OVERRIDE_A", "42");
        let v: u32 = env_override("CRUCIBLE_GC_TEST_OVERRIDE_A", 7).unwrap();
        assert_eq!(v, 42);
        env::remove_var("CRUCIBLE_GC_TEST_OVERRIDE_A");
    }

    #[test]
    fn env_override_falls_back_when_unset() {
        env::remove_var("CRUCIBLE_GC_TEST_OVERRIDE_B");
        let v: u32 = env_override("CRUCIBLE_GC_TEST_OVERRIDE_B", 99).unwrap();
        assert_eq!(v, 99);
    }

    #[test]
    fn env_override_rejects_garbage() {
        env::set_var("CRUCIBLE_GC_TEST_OVERRIDE_C", "not-a-number");
        let err = env_override::<u32>("CRUCIBLE_GC_TEST_OVERRIDE_C", 1).unwrap_err();
        assert!(matches!(err, GcError::Config { .. }));
        env::remove_var("CRUCIBLE_GC_TEST_OVERRIDE_C");
    }
}
