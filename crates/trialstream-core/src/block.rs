//! Finalized blocks and their per-channel statistics.
//!
//! A [`Block`] is produced once by
//! [`TrialScheduler::finalize`](crate::scheduler::TrialScheduler::finalize)
//! and never mutated afterwards; stores append it as-is.

use serde::{Deserialize, Serialize};

use crate::analysis::{
    autocorrelation, binomial_test, cumulative_range, hurst_rs, to_signed,
};
use crate::conditioning::split_entropy;
use crate::governor::InvalidReason;
use crate::trial::{Channel, TrialOutcome};

/// Why a block stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// Every planned trial was recorded.
    Completed,
    /// The hard wall-clock cap expired first.
    Timeout,
    /// A pause guardrail tripped; the index must be redone.
    Invalidated { reason: InvalidReason },
    /// The run was aborted from outside.
    Aborted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Invalidated { reason } => write!(f, "invalidated: {reason}"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Score and coherence diagnostics for one channel of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub hits: usize,
    pub trials: usize,
    pub hit_rate: f64,
    pub z: f64,
    pub p: f64,
    /// Range of the running ±1 sum.
    pub coherence_range: f64,
    pub hurst: f64,
    pub lag1_autocorrelation: f64,
    /// Shannon entropy of each half of the block's bits.
    pub entropy_halves: Vec<f64>,
    /// Shannon entropy of each third of the block's bits.
    pub entropy_thirds: Vec<f64>,
}

impl ChannelStats {
    pub fn compute(bits: &[u8], target: u8, p0: f64) -> Self {
        let hits = bits.iter().filter(|&&b| b == target).count();
        let test = binomial_test(hits, bits.len(), p0);
        let signed = to_signed(bits);
        Self {
            hits,
            trials: bits.len(),
            hit_rate: test.hit_rate(),
            z: test.z,
            p: test.p,
            coherence_range: cumulative_range(&signed),
            hurst: hurst_rs(&signed),
            lag1_autocorrelation: autocorrelation(&signed, 1),
            entropy_halves: split_entropy(bits, 2),
            entropy_thirds: split_entropy(bits, 3),
        }
    }
}

/// One scored batch of trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: usize,
    /// 1 for the first run of this index, higher for redos.
    pub attempt: u32,
    pub planned_trial_count: usize,
    pub target: u8,
    pub trials: Vec<TrialOutcome>,
    pub subject: ChannelStats,
    pub ghost: ChannelStats,
    pub demon: Option<ChannelStats>,
    pub pause_count: u32,
    pub total_paused_ms: u64,
    pub longest_pause_ms: u64,
    pub invalidated: bool,
    pub invalid_reason: Option<InvalidReason>,
    pub stop_reason: StopReason,
    /// Planned trials that were never recorded.
    pub shortfall: usize,
    pub fallback_trials: usize,
    /// Ticks on which no trial was recorded.
    pub skipped_ticks: usize,
    pub started_at: String,
    pub ended_at: String,
    pub elapsed_ms: u64,
}

impl Block {
    /// Raw units drawn for `channel`, in trial order.
    pub fn channel_bits(&self, channel: Channel) -> Vec<u8> {
        self.trials.iter().filter_map(|t| t.unit(channel)).collect()
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelStats> {
        match channel {
            Channel::Subject => Some(&self.subject),
            Channel::Ghost => Some(&self.ghost),
            Channel::Demon => self.demon.as_ref(),
        }
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = vec![Channel::Subject, Channel::Ghost];
        if self.demon.is_some() {
            channels.push(Channel::Demon);
        }
        channels
    }

    pub fn is_valid(&self) -> bool {
        !self.invalidated
    }

    /// Fewer trials than planned, for any reason.
    pub fn is_truncated(&self) -> bool {
        self.shortfall > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_stats_scenario() {
        let bits = [1, 0, 1, 1, 0, 1, 1, 1, 0, 1];
        let stats = ChannelStats::compute(&bits, 1, 0.5);
        assert_eq!(stats.hits, 7);
        assert_eq!(stats.trials, 10);
        assert!((stats.hit_rate - 0.7).abs() < 1e-12);
        // (7 - 5) / sqrt(2.5)
        assert!((stats.z - 1.264_911).abs() < 1e-5);
        assert_eq!(stats.entropy_halves.len(), 2);
        assert_eq!(stats.entropy_thirds.len(), 3);
    }

    #[test]
    fn test_channel_stats_target_zero() {
        let stats = ChannelStats::compute(&[0, 0, 1, 0], 0, 0.5);
        assert_eq!(stats.hits, 3);
    }

    #[test]
    fn test_channel_stats_coherence_range() {
        // Running sum 1, 2, 3, 2 → range 3.
        let stats = ChannelStats::compute(&[1, 1, 1, 0], 1, 0.5);
        assert_eq!(stats.coherence_range, 3.0);
    }

    #[test]
    fn test_channel_stats_empty() {
        let stats = ChannelStats::compute(&[], 1, 0.5);
        assert_eq!(stats.trials, 0);
        assert_eq!(stats.p, 1.0);
        assert_eq!(stats.hurst, 0.5);
    }

    #[test]
    fn test_stop_reason_serde_shape() {
        let json = serde_json::to_string(&StopReason::Invalidated {
            reason: InvalidReason::TooManyPauses { count: 6, max: 5 },
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"invalidated\""));
        assert!(json.contains("\"too_many_pauses\""));
        let back: StopReason = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, StopReason::Invalidated { .. }));
        assert_eq!(StopReason::Timeout.to_string(), "timeout");
    }
}
