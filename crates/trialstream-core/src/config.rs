//! Experiment configuration.
//!
//! An [`ExperimentConfig`] is assembled from defaults, an optional JSON file and
//! command-line overrides, then validated exactly once into a
//! [`ValidatedConfig`]. Only the validated form can drive a session; it is
//! immutable and passed by reference to every component.

use std::ops::Deref;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration violations. All of them are fatal: a run must not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cadence must be > 0 Hz, got {0}")]
    Cadence(f64),

    #[error("block duration must be > 0 ms")]
    BlockDuration,

    #[error("total planned blocks must be > 0")]
    TotalBlocks,

    #[error("null hit probability must lie in [0, 1], got {0}")]
    Probability(f64),

    #[error("allowed target set is empty")]
    NoTargets,

    #[error("target value {0} is not binary")]
    NonBinaryTarget(u8),

    #[error("pause threshold ({pause}) must be below resume threshold ({resume})")]
    Hysteresis { pause: usize, resume: usize },

    #[error("warmup threshold ({warmup}) must be at least the resume threshold ({resume})")]
    Warmup { warmup: usize, resume: usize },

    #[error("entropy window size must be > 0")]
    WindowSize,

    #[error("max block attempts must be > 0")]
    BlockAttempts,

    #[error("retry policy needs at least one attempt")]
    RetryAttempts,

    #[error("cadence {0} Hz is too fast for a nanosecond trial clock")]
    TickPeriod(f64),

    #[error("block of {planned} trials plus grace overflows the block timeout")]
    BlockTooLong { planned: usize },

    #[error("{duration_ms} ms at {cadence_hz} Hz yields no trials")]
    NoTrials { duration_ms: u64, cadence_hz: f64 },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Hysteresis and warmup thresholds, in buffered units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub pause_threshold: usize,
    pub resume_threshold: usize,
    pub warmup_threshold: usize,
    pub warmup_timeout_ms: u64,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            pause_threshold: 4,
            resume_threshold: 16,
            warmup_threshold: 32,
            warmup_timeout_ms: 3_000,
        }
    }
}

impl GovernorSettings {
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }
}

/// Block invalidation limits. A block is invalidated when any one of them is
/// strictly exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Guardrails {
    pub max_pauses: u32,
    pub max_total_pause_ms: u64,
    pub max_single_pause_ms: u64,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_pauses: 5,
            max_total_pause_ms: 5_000,
            max_single_pause_ms: 2_000,
        }
    }
}

/// Source reconnection policy: exponential backoff, bounded attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Raw, unvalidated experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Visual cadence; one trial per tick.
    pub cadence_hz: f64,
    pub block_duration_ms: u64,
    pub total_blocks: usize,
    /// Hit probability under the null hypothesis (`p0` in the z-test).
    pub null_hit_probability: f64,
    pub allowed_targets: Vec<u8>,
    /// Draw a third, demon, control unit on every trial.
    pub demon_channel: bool,
    pub governor: GovernorSettings,
    pub guardrails: Guardrails,
    /// Slack added to the nominal block length before the hard stop.
    pub grace_ms: u64,
    pub entropy_window_size: usize,
    pub retry: RetryPolicy,
    /// Chunks shorter than this are discarded as malformed.
    pub min_chunk_units: usize,
    /// How many times one block index may be run before the session gives up.
    pub max_block_attempts: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            cadence_hz: 5.0,
            block_duration_ms: 30_000,
            total_blocks: 10,
            null_hit_probability: 0.5,
            allowed_targets: vec![0, 1],
            demon_channel: true,
            governor: GovernorSettings::default(),
            guardrails: Guardrails::default(),
            grace_ms: 5_000,
            entropy_window_size: 1_000,
            retry: RetryPolicy::default(),
            min_chunk_units: 1,
            max_block_attempts: 3,
        }
    }
}

impl ExperimentConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Check every rule and freeze the configuration.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if !(self.cadence_hz.is_finite() && self.cadence_hz > 0.0) {
            return Err(ConfigError::Cadence(self.cadence_hz));
        }
        if self.block_duration_ms == 0 {
            return Err(ConfigError::BlockDuration);
        }
        if self.total_blocks == 0 {
            return Err(ConfigError::TotalBlocks);
        }
        if !(0.0..=1.0).contains(&self.null_hit_probability) {
            return Err(ConfigError::Probability(self.null_hit_probability));
        }
        if self.allowed_targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if let Some(&bad) = self.allowed_targets.iter().find(|&&t| t > 1) {
            return Err(ConfigError::NonBinaryTarget(bad));
        }
        let g = &self.governor;
        if g.pause_threshold >= g.resume_threshold {
            return Err(ConfigError::Hysteresis {
                pause: g.pause_threshold,
                resume: g.resume_threshold,
            });
        }
        if g.warmup_threshold < g.resume_threshold {
            return Err(ConfigError::Warmup {
                warmup: g.warmup_threshold,
                resume: g.resume_threshold,
            });
        }
        if self.entropy_window_size == 0 {
            return Err(ConfigError::WindowSize);
        }
        if self.max_block_attempts == 0 {
            return Err(ConfigError::BlockAttempts);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::RetryAttempts);
        }

        let planned_trial_count =
            (self.block_duration_ms as f64 * self.cadence_hz / 1000.0).floor() as usize;
        if planned_trial_count == 0 {
            return Err(ConfigError::NoTrials {
                duration_ms: self.block_duration_ms,
                cadence_hz: self.cadence_hz,
            });
        }
        let tick_period = Duration::from_nanos((1e9 / self.cadence_hz).round() as u64);
        if tick_period.is_zero() {
            return Err(ConfigError::TickPeriod(self.cadence_hz));
        }
        let hard_timeout = u32::try_from(planned_trial_count)
            .ok()
            .and_then(|n| tick_period.checked_mul(n))
            .and_then(|d| d.checked_add(Duration::from_millis(self.grace_ms)))
            .ok_or(ConfigError::BlockTooLong {
                planned: planned_trial_count,
            })?;

        Ok(ValidatedConfig {
            inner: self,
            tick_period,
            planned_trial_count,
            hard_timeout,
        })
    }
}

/// A configuration that passed [`ExperimentConfig::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    inner: ExperimentConfig,
    tick_period: Duration,
    planned_trial_count: usize,
    hard_timeout: Duration,
}

impl ValidatedConfig {
    /// Trial clock period, `1000 / Hz` ms.
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    pub fn planned_trial_count(&self) -> usize {
        self.planned_trial_count
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.inner.block_duration_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.inner.grace_ms)
    }

    /// Wall-clock cap for one block: `planned * T + grace`.
    pub fn hard_timeout(&self) -> Duration {
        self.hard_timeout
    }

    /// Units consumed by one trial: subject, ghost and optionally demon.
    pub fn units_per_trial(&self) -> usize {
        if self.inner.demon_channel { 3 } else { 2 }
    }

    pub fn as_config(&self) -> &ExperimentConfig {
        &self.inner
    }
}

impl Deref for ValidatedConfig {
    type Target = ExperimentConfig;

    fn deref(&self) -> &ExperimentConfig {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = ExperimentConfig::default().validate().unwrap();
        assert_eq!(cfg.planned_trial_count(), 150);
        assert_eq!(cfg.tick_period(), Duration::from_millis(200));
        assert_eq!(cfg.units_per_trial(), 3);
    }

    #[test]
    fn test_hard_timeout() {
        let cfg = ExperimentConfig {
            cadence_hz: 10.0,
            block_duration_ms: 1_000,
            grace_ms: 500,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(cfg.planned_trial_count(), 10);
        assert_eq!(cfg.hard_timeout(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_rejects_cadence_with_zero_tick() {
        let err = ExperimentConfig {
            cadence_hz: 3e9,
            block_duration_ms: 1,
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::TickPeriod(_)));
    }

    #[test]
    fn test_fastest_accepted_cadence_has_nonzero_tick() {
        let cfg = ExperimentConfig {
            cadence_hz: 1e9,
            block_duration_ms: 1,
            grace_ms: 0,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(cfg.tick_period(), Duration::from_nanos(1));
        assert_eq!(cfg.planned_trial_count(), 1_000_000);
        assert_eq!(cfg.hard_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_rejects_block_timeout_overflow() {
        let err = ExperimentConfig {
            cadence_hz: 1_000.0,
            block_duration_ms: u64::MAX / 2,
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::BlockTooLong { .. }));
    }

    #[test]
    fn test_rejects_zero_cadence() {
        let err = ExperimentConfig {
            cadence_hz: 0.0,
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Cadence(_)));
    }

    #[test]
    fn test_rejects_nan_cadence() {
        let err = ExperimentConfig {
            cadence_hz: f64::NAN,
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Cadence(_)));
    }

    #[test]
    fn test_rejects_probability_out_of_range() {
        for p in [-0.1, 1.5] {
            let err = ExperimentConfig {
                null_hit_probability: p,
                ..Default::default()
            }
            .validate()
            .unwrap_err();
            assert!(matches!(err, ConfigError::Probability(_)));
        }
    }

    #[test]
    fn test_rejects_empty_targets() {
        let err = ExperimentConfig {
            allowed_targets: vec![],
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoTargets));
    }

    #[test]
    fn test_rejects_non_binary_target() {
        let err = ExperimentConfig {
            allowed_targets: vec![1, 2],
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::NonBinaryTarget(2)));
    }

    #[test]
    fn test_rejects_inverted_hysteresis() {
        let mut cfg = ExperimentConfig::default();
        cfg.governor.pause_threshold = 16;
        cfg.governor.resume_threshold = 16;
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::Hysteresis { .. }
        ));
    }

    #[test]
    fn test_rejects_zero_blocks_and_duration() {
        assert!(matches!(
            ExperimentConfig {
                total_blocks: 0,
                ..Default::default()
            }
            .validate()
            .unwrap_err(),
            ConfigError::TotalBlocks
        ));
        assert!(matches!(
            ExperimentConfig {
                block_duration_ms: 0,
                ..Default::default()
            }
            .validate()
            .unwrap_err(),
            ConfigError::BlockDuration
        ));
    }

    #[test]
    fn test_rejects_block_shorter_than_one_tick() {
        let err = ExperimentConfig {
            cadence_hz: 1.0,
            block_duration_ms: 500,
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoTrials { .. }));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: ExperimentConfig =
            serde_json::from_str(r#"{"cadence_hz": 2.0, "guardrails": {"max_pauses": 1}}"#)
                .unwrap();
        assert_eq!(cfg.cadence_hz, 2.0);
        assert_eq!(cfg.guardrails.max_pauses, 1);
        assert_eq!(cfg.guardrails.max_total_pause_ms, 5_000);
        assert_eq!(cfg.total_blocks, 10);
    }

    #[test]
    fn test_from_json_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(&path, r#"{"total_blocks": 3, "demon_channel": false}"#).unwrap();
        let cfg = ExperimentConfig::from_json_path(&path).unwrap();
        assert_eq!(cfg.total_blocks, 3);
        assert!(!cfg.demon_channel);
        let validated = cfg.validate().unwrap();
        assert_eq!(validated.units_per_trial(), 2);
    }
}
