//! # trialstream-stats
//!
//! Cross-session statistics over persisted trial blocks.
//!
//! Everything here is a read-only reduction over finished [`Block`] records.
//! Invalidated attempts are always excluded; fallback blocks are included
//! unless [`StatisticsEngine::exclude_fallback`] is set.
//!
//! ```no_run
//! use trialstream_stats::StatisticsEngine;
//!
//! let sessions = trialstream_core::load_sessions("sessions".as_ref()).unwrap();
//! let report = StatisticsEngine::new().analyze(&sessions);
//! println!("{} blocks, subject z = {:.2}", report.blocks, report.channels[0].z);
//! ```

pub mod channels;
pub mod serial;
pub mod spectral;

use serde::Serialize;
use trialstream_core::analysis::{binomial_test, mean};
use trialstream_core::{Block, Channel, SessionRecord};

pub use channels::{CrossChannel, LaggedCorrelation, compare_channels, cross_correlation};
pub use serial::{
    HalvesComparison, LagAutocorrelation, RunsTest, TurningPoints, halves_comparison,
    lag_autocorrelations, runs_test, turning_points,
};
pub use spectral::{DampedFit, SpectralPeak, SpectralReport, damped_fit, spectral_peaks};

/// Lags examined on the block hit-rate series.
pub const MAX_SERIAL_LAG: usize = 5;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Aggregate hit statistics for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelAggregate {
    pub channel: Channel,
    pub hits: usize,
    pub trials: usize,
    pub hit_rate: f64,
    pub z: f64,
    pub p: f64,
    /// Blocks that carried this channel.
    pub blocks: usize,
    pub mean_block_hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub sessions: usize,
    /// Blocks analyzed.
    pub blocks: usize,
    pub invalidated_blocks: usize,
    pub excluded_fallback_blocks: usize,
    pub trials: usize,
    /// Fallback trials inside the analyzed blocks.
    pub fallback_trials: usize,
    pub p0: f64,
    pub channels: Vec<ChannelAggregate>,
    /// Subject hit rate per analyzed block, in run order.
    pub block_hit_rates: Vec<f64>,
    pub autocorrelation: Vec<LagAutocorrelation>,
    /// Runs of block hit rates above and below `p0`.
    pub runs: Option<RunsTest>,
    pub turning_points: Option<TurningPoints>,
    pub halves: Option<HalvesComparison>,
    pub cross_channel: Vec<CrossChannel>,
    pub spectral: Option<SpectralReport>,
    pub damped_fit: Option<DampedFit>,
}

impl AnalysisReport {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelAggregate> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    /// Lags whose autocorrelation crossed the significance threshold.
    pub fn significant_lags(&self) -> Vec<usize> {
        self.autocorrelation
            .iter()
            .filter(|l| l.significant)
            .map(|l| l.lag)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatisticsEngine {
    p0: f64,
    exclude_fallback: bool,
}

impl Default for StatisticsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsEngine {
    pub fn new() -> Self {
        Self {
            p0: 0.5,
            exclude_fallback: false,
        }
    }

    /// Null hit probability for the aggregate z-tests and the runs cut.
    pub fn with_p0(mut self, p0: f64) -> Self {
        self.p0 = p0;
        self
    }

    /// Leave out every block that used the local fallback generator.
    pub fn exclude_fallback(mut self, exclude: bool) -> Self {
        self.exclude_fallback = exclude;
        self
    }

    /// Analyze sessions in the order given; blocks keep their append order
    /// within a session.
    pub fn analyze(&self, sessions: &[SessionRecord]) -> AnalysisReport {
        let all: Vec<&Block> = sessions.iter().flat_map(|s| &s.blocks).collect();
        let invalidated_blocks = all.iter().filter(|b| !b.is_valid()).count();
        let valid: Vec<&Block> = all.iter().copied().filter(|b| b.is_valid()).collect();
        let (blocks, excluded): (Vec<&Block>, Vec<&Block>) = valid
            .into_iter()
            .partition(|b| !(self.exclude_fallback && b.fallback_trials > 0));
        let blocks: Vec<&Block> = blocks.into_iter().filter(|b| !b.trials.is_empty()).collect();

        log::debug!(
            "analyzing {} blocks from {} sessions ({} invalidated, {} fallback excluded)",
            blocks.len(),
            sessions.len(),
            invalidated_blocks,
            excluded.len()
        );

        let channels = [Channel::Subject, Channel::Ghost, Channel::Demon]
            .into_iter()
            .filter_map(|channel| self.aggregate(&blocks, channel))
            .collect();

        let series: Vec<f64> = blocks.iter().map(|b| b.subject.hit_rate).collect();

        let mut cross_channel = Vec::new();
        for (a, b) in [
            (Channel::Subject, Channel::Ghost),
            (Channel::Subject, Channel::Demon),
            (Channel::Ghost, Channel::Demon),
        ] {
            cross_channel.extend(compare_channels(&blocks, a, b));
        }

        AnalysisReport {
            sessions: sessions.len(),
            blocks: blocks.len(),
            invalidated_blocks,
            excluded_fallback_blocks: excluded.len(),
            trials: blocks.iter().map(|b| b.trials.len()).sum(),
            fallback_trials: blocks.iter().map(|b| b.fallback_trials).sum(),
            p0: self.p0,
            channels,
            autocorrelation: lag_autocorrelations(&series, MAX_SERIAL_LAG),
            runs: runs_test(&series, self.p0),
            turning_points: turning_points(&series),
            halves: halves_comparison(&series),
            cross_channel,
            spectral: spectral_peaks(&series),
            damped_fit: damped_fit(&series),
            block_hit_rates: series,
        }
    }

    fn aggregate(&self, blocks: &[&Block], channel: Channel) -> Option<ChannelAggregate> {
        let stats: Vec<_> = blocks.iter().filter_map(|b| b.channel(channel)).collect();
        if stats.is_empty() {
            return None;
        }
        let hits = stats.iter().map(|s| s.hits).sum();
        let trials = stats.iter().map(|s| s.trials).sum();
        let test = binomial_test(hits, trials, self.p0);
        let rates: Vec<f64> = stats.iter().map(|s| s.hit_rate).collect();
        Some(ChannelAggregate {
            channel,
            hits,
            trials,
            hit_rate: test.hit_rate(),
            z: test.z,
            p: test.p,
            blocks: stats.len(),
            mean_block_hit_rate: mean(&rates),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        let report = StatisticsEngine::new().analyze(&[]);
        assert_eq!(report.sessions, 0);
        assert_eq!(report.blocks, 0);
        assert!(report.channels.is_empty());
        assert!(report.autocorrelation.is_empty());
        assert!(report.runs.is_none());
        assert!(report.spectral.is_none());
        assert!(report.cross_channel.is_empty());
    }

    #[test]
    fn test_builder() {
        let engine = StatisticsEngine::new().with_p0(0.25).exclude_fallback(true);
        assert_eq!(engine.p0, 0.25);
        assert!(engine.exclude_fallback);
        assert_eq!(engine.analyze(&[]).p0, 0.25);
    }
}
