//! Fixed-rate trial scheduler.
//!
//! The scheduler is a plain state machine. It owns the block's
//! [`BufferGovernor`] and its fallback generator, and is driven by
//! [`tick`](TrialScheduler::tick) calls stamped with the offset from the
//! block's clock origin. The clock itself lives in the runner, so one
//! scheduler can never be driven by two timers.
//!
//! ```text
//! Idle → Warmup → Running ⇄ Paused → Finalizing → Completed | Invalidated
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::block::{Block, ChannelStats, StopReason};
use crate::buffer::{BufferError, StreamBuffer};
use crate::config::ValidatedConfig;
use crate::governor::{BufferGovernor, Transition, WarmupStatus};
use crate::session::format_iso8601;
use crate::source::{FALLBACK_LABEL, FallbackSource};
use crate::trial::{Channel, ChannelStrategy, TargetAssignment, TrialOutcome};

/// Upper bound on the up-front trial allocation; longer blocks grow on demand.
const MAX_PREALLOCATED_TRIALS: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Warmup,
    Running,
    Paused,
    /// Stopped; waiting for [`TrialScheduler::finalize`].
    Finalizing,
    Completed,
    Invalidated,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("block {0} already started")]
    AlreadyStarted(usize),

    #[error("block {0} is not running")]
    NotRunning(usize),

    #[error("block {0} already finalized")]
    AlreadyFinalized(usize),
}

/// Why a tick recorded nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    /// A draw found too few units; the governor was paused.
    Underrun { requested: usize, available: usize },
}

/// Result of one clock tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NotRunning,
    WarmingUp,
    Skipped(SkipReason),
    Recorded(TrialOutcome),
    Stopped(StopReason),
}

pub struct TrialScheduler<'a> {
    config: &'a ValidatedConfig,
    target: TargetAssignment,
    block_index: usize,
    attempt: u32,
    state: SchedulerState,
    governor: BufferGovernor,
    fallback: FallbackSource,
    fallback_active: bool,
    trials: Vec<TrialOutcome>,
    skipped_ticks: usize,
    started_wall: Option<SystemTime>,
    stop: Option<(StopReason, Duration)>,
}

impl<'a> TrialScheduler<'a> {
    pub fn new(
        config: &'a ValidatedConfig,
        target: TargetAssignment,
        block_index: usize,
        attempt: u32,
        fallback: FallbackSource,
    ) -> Self {
        Self {
            config,
            target,
            block_index,
            attempt,
            state: SchedulerState::Idle,
            governor: BufferGovernor::new(config.governor.clone(), config.guardrails.clone()),
            fallback,
            fallback_active: false,
            trials: Vec::with_capacity(config.planned_trial_count().min(MAX_PREALLOCATED_TRIALS)),
            skipped_ticks: 0,
            started_wall: None,
            stop: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn trials_recorded(&self) -> usize {
        self.trials.len()
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_active
    }

    /// True once a stop condition has been reached.
    pub fn is_finished(&self) -> bool {
        self.stop.is_some()
    }

    pub fn governor(&self) -> &BufferGovernor {
        &self.governor
    }

    /// Enter warmup. Only valid once per block.
    pub fn start(&mut self, at: Duration) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::AlreadyStarted(self.block_index));
        }
        self.state = SchedulerState::Warmup;
        self.started_wall = Some(SystemTime::now());
        self.governor.begin_warmup(at);
        log::info!(
            "block {} (attempt {}) started: {} trials planned",
            self.block_index,
            self.attempt,
            self.config.planned_trial_count()
        );
        Ok(())
    }

    /// Draw from the local generator for the rest of the block.
    pub fn use_fallback(&mut self) {
        if !self.fallback_active {
            log::warn!(
                "block {}: switching to {FALLBACK_LABEL} source",
                self.block_index
            );
            self.fallback_active = true;
        }
    }

    /// Stop an active block from outside; the block is finalized as aborted.
    pub fn stop(&mut self, at: Duration) -> Result<(), SchedulerError> {
        match self.state {
            SchedulerState::Warmup | SchedulerState::Running | SchedulerState::Paused => {
                self.halt(at, StopReason::Aborted);
                Ok(())
            }
            _ => Err(SchedulerError::NotRunning(self.block_index)),
        }
    }

    /// Handle one clock tick at offset `at`.
    pub fn tick(&mut self, at: Duration, buffer: &mut StreamBuffer) -> TickOutcome {
        if !matches!(
            self.state,
            SchedulerState::Warmup | SchedulerState::Running | SchedulerState::Paused
        ) {
            return TickOutcome::NotRunning;
        }
        if let Some(stopped) = self.check_invalidated(at) {
            return stopped;
        }
        if at >= self.config.hard_timeout() {
            return self.halt(at, StopReason::Timeout);
        }

        if self.state == SchedulerState::Warmup {
            if self.fallback_active {
                self.top_up(buffer);
            }
            match self.governor.poll_warmup(buffer.depth(), at) {
                WarmupStatus::Waiting => return TickOutcome::WarmingUp,
                WarmupStatus::TimedOut => {
                    log::warn!(
                        "block {}: warmup timed out at depth {}",
                        self.block_index,
                        buffer.depth()
                    );
                    self.use_fallback();
                }
                WarmupStatus::Ready => {}
            }
            self.state = SchedulerState::Running;
        }

        if self.fallback_active {
            self.top_up(buffer);
        }
        match self.governor.observe(buffer.depth(), at) {
            Transition::Paused => self.state = SchedulerState::Paused,
            Transition::Resumed => self.state = SchedulerState::Running,
            Transition::None => {}
        }
        if self.governor.is_paused() {
            return self.skip(at, SkipReason::Paused);
        }

        let needed = self.config.units_per_trial();
        if buffer.depth() < needed {
            return self.underrun(at, needed, buffer.depth());
        }
        match self.draw(at, buffer) {
            Ok(outcome) => {
                self.trials.push(outcome.clone());
                if self.trials.len() == self.config.planned_trial_count() {
                    self.halt(at, StopReason::Completed);
                }
                TickOutcome::Recorded(outcome)
            }
            Err(BufferError::Underrun {
                requested,
                available,
            }) => self.underrun(at, requested, available),
        }
    }

    /// Build the immutable block record. Stops the block first if it is
    /// still active.
    pub fn finalize(&mut self, at: Duration) -> Result<Block, SchedulerError> {
        match self.state {
            SchedulerState::Idle => return Err(SchedulerError::NotRunning(self.block_index)),
            SchedulerState::Completed | SchedulerState::Invalidated => {
                return Err(SchedulerError::AlreadyFinalized(self.block_index));
            }
            SchedulerState::Finalizing => {}
            SchedulerState::Warmup | SchedulerState::Running | SchedulerState::Paused => {
                self.halt(at, StopReason::Aborted);
            }
        }
        let (stop_reason, stopped_at) = self
            .stop
            .clone()
            .unwrap_or((StopReason::Aborted, at));
        let pauses = self.governor.finish(stopped_at);
        let invalid_reason = self.governor.invalid_reason().cloned();
        let invalidated = matches!(stop_reason, StopReason::Invalidated { .. });
        self.state = if invalidated {
            SchedulerState::Invalidated
        } else {
            SchedulerState::Completed
        };

        let trials = std::mem::take(&mut self.trials);
        let target = self.target.value;
        let p0 = self.config.null_hit_probability;
        let stats = |channel: Channel| {
            let bits: Vec<u8> = trials.iter().filter_map(|t| t.unit(channel)).collect();
            ChannelStats::compute(&bits, target, p0)
        };
        let subject = stats(Channel::Subject);
        let ghost = stats(Channel::Ghost);
        let demon = self.config.demon_channel.then(|| stats(Channel::Demon));

        let started = self.started_wall.unwrap_or_else(SystemTime::now);
        let ended = SystemTime::now();
        let epoch = |t: SystemTime| format_iso8601(t.duration_since(UNIX_EPOCH).unwrap_or_default());

        let block = Block {
            index: self.block_index,
            attempt: self.attempt,
            planned_trial_count: self.config.planned_trial_count(),
            target,
            shortfall: self.config.planned_trial_count().saturating_sub(trials.len()),
            fallback_trials: trials.iter().filter(|t| t.fallback).count(),
            trials,
            subject,
            ghost,
            demon,
            pause_count: pauses.pause_count,
            total_paused_ms: pauses.total_paused.as_millis() as u64,
            longest_pause_ms: pauses.longest_pause.as_millis() as u64,
            invalidated,
            invalid_reason,
            stop_reason,
            skipped_ticks: self.skipped_ticks,
            started_at: epoch(started),
            ended_at: epoch(ended),
            elapsed_ms: stopped_at.as_millis() as u64,
        };
        Ok(block)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn halt(&mut self, at: Duration, reason: StopReason) -> TickOutcome {
        if self.stop.is_none() {
            log::info!(
                "block {} (attempt {}) stopped after {} trials: {reason}",
                self.block_index,
                self.attempt,
                self.trials.len()
            );
            self.stop = Some((reason.clone(), at));
            self.state = SchedulerState::Finalizing;
        }
        TickOutcome::Stopped(reason)
    }

    fn check_invalidated(&mut self, at: Duration) -> Option<TickOutcome> {
        let reason = self.governor.check_invalidation(at)?.clone();
        Some(self.halt(at, StopReason::Invalidated { reason }))
    }

    fn skip(&mut self, at: Duration, reason: SkipReason) -> TickOutcome {
        // A fresh pause may be the one that crosses a guardrail.
        if let Some(stopped) = self.check_invalidated(at) {
            return stopped;
        }
        self.skipped_ticks += 1;
        TickOutcome::Skipped(reason)
    }

    fn underrun(&mut self, at: Duration, requested: usize, available: usize) -> TickOutcome {
        log::debug!(
            "block {}: underrun ({available}/{requested} units)",
            self.block_index
        );
        if self.governor.force_pause(at) == Transition::Paused {
            self.state = SchedulerState::Paused;
        }
        self.skip(
            at,
            SkipReason::Underrun {
                requested,
                available,
            },
        )
    }

    /// Refill the buffer to the warmup threshold from the local generator.
    fn top_up(&mut self, buffer: &mut StreamBuffer) {
        let want = self
            .config
            .governor
            .warmup_threshold
            .max(self.config.units_per_trial());
        let depth = buffer.depth();
        if depth < want {
            buffer.push(self.fallback.next_chunk(want - depth));
        }
    }

    fn draw(&self, at: Duration, buffer: &mut StreamBuffer) -> Result<TrialOutcome, BufferError> {
        let index = self.trials.len();
        let strategy = ChannelStrategy::for_trial(index);
        let (subject, ghost) = match strategy {
            ChannelStrategy::Alternating => {
                let pair = buffer.pop(2)?;
                (pair[0], pair[1])
            }
            ChannelStrategy::Independent => {
                let subject = buffer.pop(1)?[0];
                let ghost = buffer.pop(1)?[0];
                (subject, ghost)
            }
        };
        let same_chunk = subject.chunk == ghost.chunk;
        let demon = if self.config.demon_channel {
            Some(buffer.pop(1)?[0])
        } else {
            None
        };

        let units: Vec<_> = [Some(subject), Some(ghost), demon].into_iter().flatten().collect();
        let source_labels: Vec<String> = units.iter().map(|u| buffer.label(u).to_string()).collect();
        let fallback = source_labels.iter().any(|l| l == FALLBACK_LABEL);

        Ok(TrialOutcome {
            index,
            strategy,
            subject_unit: subject.value,
            ghost_unit: ghost.value,
            demon_unit: demon.map(|u| u.value),
            raw_source_indices: units.iter().map(|u| u.global_index).collect(),
            same_chunk,
            source_labels,
            fallback,
            subject_hit: self.target.is_hit(subject.value),
            ghost_hit: self.target.is_hit(ghost.value),
            demon_hit: demon.map(|u| self.target.is_hit(u.value)),
            at_ms: at.as_millis() as u64,
        })
    }
}
