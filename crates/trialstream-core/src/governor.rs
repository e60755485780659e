//! Hysteresis pause/resume governor.
//!
//! The governor watches buffer depth and decides whether the trial clock may
//! consume. Two thresholds with a dead zone between them keep it from flapping
//! under small depth fluctuations:
//!
//! ```text
//! Flowing --(depth <  pause_threshold)--> Paused
//! Paused  --(depth >= resume_threshold)--> Flowing
//! ```
//!
//! It also gates the first draw of a block behind a warmup threshold, tracks
//! pause count and durations, and applies the block invalidation guardrails.
//! All times are offsets from the block's own clock origin.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{GovernorSettings, Guardrails};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    /// Waiting for the buffer to fill before the first draw.
    Warmup,
    Flowing,
    Paused,
}

/// Result of a depth observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Paused,
    Resumed,
}

/// Result of polling the warmup gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupStatus {
    Waiting,
    Ready,
    /// The gate expired before the buffer filled; use the fallback source.
    TimedOut,
}

/// Pause bookkeeping for one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseStats {
    pub pause_count: u32,
    pub total_paused: Duration,
    pub longest_pause: Duration,
}

/// Which guardrail tripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidReason {
    TooManyPauses { count: u32, max: u32 },
    TotalPauseExceeded { total_ms: u64, max_ms: u64 },
    SinglePauseExceeded { longest_ms: u64, max_ms: u64 },
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyPauses { count, max } => write!(f, "{count} pauses (max {max})"),
            Self::TotalPauseExceeded { total_ms, max_ms } => {
                write!(f, "{total_ms} ms paused in total (max {max_ms} ms)")
            }
            Self::SinglePauseExceeded { longest_ms, max_ms } => {
                write!(f, "single pause of {longest_ms} ms (max {max_ms} ms)")
            }
        }
    }
}

impl Guardrails {
    /// Returns the first limit that `stats` strictly exceeds, if any.
    pub fn evaluate(&self, stats: &PauseStats) -> Option<InvalidReason> {
        if stats.pause_count > self.max_pauses {
            return Some(InvalidReason::TooManyPauses {
                count: stats.pause_count,
                max: self.max_pauses,
            });
        }
        let total_ms = stats.total_paused.as_millis() as u64;
        if stats.total_paused > Duration::from_millis(self.max_total_pause_ms) {
            return Some(InvalidReason::TotalPauseExceeded {
                total_ms,
                max_ms: self.max_total_pause_ms,
            });
        }
        let longest_ms = stats.longest_pause.as_millis() as u64;
        if stats.longest_pause > Duration::from_millis(self.max_single_pause_ms) {
            return Some(InvalidReason::SinglePauseExceeded {
                longest_ms,
                max_ms: self.max_single_pause_ms,
            });
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct BufferGovernor {
    settings: GovernorSettings,
    guardrails: Guardrails,
    state: GovernorState,
    warmup_started: Option<Duration>,
    paused_since: Option<Duration>,
    stats: PauseStats,
    invalid: Option<InvalidReason>,
}

impl BufferGovernor {
    /// A governor that starts out flowing. Call [`begin_warmup`](Self::begin_warmup)
    /// to gate the first draw.
    pub fn new(settings: GovernorSettings, guardrails: Guardrails) -> Self {
        Self {
            settings,
            guardrails,
            state: GovernorState::Flowing,
            warmup_started: None,
            paused_since: None,
            stats: PauseStats::default(),
            invalid: None,
        }
    }

    pub fn state(&self) -> GovernorState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == GovernorState::Paused
    }

    pub fn begin_warmup(&mut self, at: Duration) {
        self.state = GovernorState::Warmup;
        self.warmup_started = Some(at);
    }

    /// Poll the warmup gate. Leaves warmup on `Ready` or `TimedOut`.
    pub fn poll_warmup(&mut self, depth: usize, at: Duration) -> WarmupStatus {
        if self.state != GovernorState::Warmup {
            return WarmupStatus::Ready;
        }
        if depth >= self.settings.warmup_threshold {
            self.state = GovernorState::Flowing;
            return WarmupStatus::Ready;
        }
        let started = self.warmup_started.unwrap_or(at);
        if at.saturating_sub(started) >= self.settings.warmup_timeout() {
            self.state = GovernorState::Flowing;
            return WarmupStatus::TimedOut;
        }
        WarmupStatus::Waiting
    }

    /// Apply the hysteresis rule to a depth reading.
    pub fn observe(&mut self, depth: usize, at: Duration) -> Transition {
        match self.state {
            GovernorState::Warmup => Transition::None,
            GovernorState::Flowing if depth < self.settings.pause_threshold => {
                self.enter_pause(at);
                Transition::Paused
            }
            GovernorState::Paused if depth >= self.settings.resume_threshold => {
                self.leave_pause(at);
                Transition::Resumed
            }
            _ => Transition::None,
        }
    }

    /// Pause immediately, regardless of depth. Used when a draw underruns.
    pub fn force_pause(&mut self, at: Duration) -> Transition {
        if self.state == GovernorState::Flowing {
            self.enter_pause(at);
            Transition::Paused
        } else {
            Transition::None
        }
    }

    /// Check the guardrails, counting any pause still in progress.
    ///
    /// Invalidation is sticky: once tripped, the first reason is kept for the
    /// rest of the block.
    pub fn check_invalidation(&mut self, at: Duration) -> Option<&InvalidReason> {
        if self.invalid.is_none() {
            let snapshot = self.stats_at(at);
            if let Some(reason) = self.guardrails.evaluate(&snapshot) {
                log::warn!("block invalidated: {reason}");
                self.invalid = Some(reason);
            }
        }
        self.invalid.as_ref()
    }

    pub fn invalid_reason(&self) -> Option<&InvalidReason> {
        self.invalid.as_ref()
    }

    /// Pause statistics as they would stand if the current pause ended at `at`.
    pub fn stats_at(&self, at: Duration) -> PauseStats {
        let mut stats = self.stats;
        if let Some(since) = self.paused_since {
            let ongoing = at.saturating_sub(since);
            stats.total_paused += ongoing;
            stats.longest_pause = stats.longest_pause.max(ongoing);
        }
        stats
    }

    /// Close any open pause and return the final statistics.
    pub fn finish(&mut self, at: Duration) -> PauseStats {
        if self.paused_since.is_some() {
            self.leave_pause(at);
        }
        self.stats
    }

    fn enter_pause(&mut self, at: Duration) {
        self.state = GovernorState::Paused;
        self.paused_since = Some(at);
        self.stats.pause_count += 1;
        log::debug!("governor paused (pause #{})", self.stats.pause_count);
    }

    fn leave_pause(&mut self, at: Duration) {
        self.state = GovernorState::Flowing;
        if let Some(since) = self.paused_since.take() {
            let elapsed = at.saturating_sub(since);
            self.stats.total_paused += elapsed;
            self.stats.longest_pause = self.stats.longest_pause.max(elapsed);
            log::debug!("governor resumed after {} ms", elapsed.as_millis());
        }
    }
}
