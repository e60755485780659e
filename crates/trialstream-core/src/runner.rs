//! Async session runner.
//!
//! Each block gets its own buffer, governor and scheduler. One task drives
//! them with `tokio::select!` over three inputs:
//!
//! ```text
//! abort (watch) ─┐
//! chunks (mpsc) ─┼─► select! ─► StreamBuffer::push / TrialScheduler::tick
//! trial clock   ─┘
//! ```
//!
//! Appends and ticks run one at a time on the same task, so the buffer needs
//! no locking and arrival order is preserved across ticks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::block::{Block, StopReason};
use crate::buffer::StreamBuffer;
use crate::config::ValidatedConfig;
use crate::scheduler::{SchedulerError, TrialScheduler};
use crate::session::{
    EarlyExit, Session, SessionHandle, SessionMeta, SessionStore, SessionSummary, StoreError,
};
use crate::source::{
    Connection, EntropySource, FallbackSource, SourceEvent, connect_with_retry, validate_chunk,
};

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

/// Cloneable, idempotent stop signal for a running session.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        if !self.tx.send_replace(true) {
            log::info!("abort requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub summary: SessionSummary,
    /// Every block attempt in run order, invalidated ones included.
    pub blocks: Vec<Block>,
    pub session: Session,
    /// Records the store has not accepted yet.
    pub pending_writes: usize,
}

#[derive(Debug)]
enum PendingWrite {
    Create(SessionMeta),
    Block(Box<Block>),
    Complete(SessionSummary),
}

type BlockObserver = Box<dyn FnMut(&Block) + Send>;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct SessionRunner<S, T> {
    config: ValidatedConfig,
    meta: SessionMeta,
    source: S,
    store: T,
    handle: SessionHandle,
    fallback: FallbackSource,
    abort: AbortHandle,
    observer: Option<BlockObserver>,
    backlog: VecDeque<PendingWrite>,
}

impl<S: EntropySource, T: SessionStore> SessionRunner<S, T> {
    /// `meta` must have been built from `config`; its target is used for
    /// every block.
    pub fn new(
        config: ValidatedConfig,
        meta: SessionMeta,
        source: S,
        store: T,
        fallback: FallbackSource,
    ) -> Self {
        let handle = SessionHandle {
            id: meta.id.clone(),
        };
        Self {
            config,
            meta,
            source,
            store,
            handle,
            fallback,
            abort: AbortHandle::new(),
            observer: None,
            backlog: VecDeque::new(),
        }
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    /// Called with every finished block attempt, after it is handed to the store.
    pub fn on_block(mut self, observer: impl FnMut(&Block) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut T {
        &mut self.store
    }

    pub fn pending_writes(&self) -> usize {
        self.backlog.len()
    }

    /// Run every planned block. Call once per runner.
    pub async fn run(&mut self) -> SessionOutcome {
        log::info!(
            "session {} starting: {} blocks of {} trials, target {}",
            self.meta.id,
            self.config.total_blocks,
            self.config.planned_trial_count(),
            self.meta.target.value
        );
        self.persist(PendingWrite::Create(self.meta.clone()));

        let mut session = Session::new(&self.meta, &self.config);
        let mut blocks = Vec::new();
        let mut index = 0;
        let mut attempt = 1u32;

        let early_exit = loop {
            if index >= self.config.total_blocks {
                break None;
            }
            if self.abort.is_aborted() {
                break Some(EarlyExit::Aborted);
            }
            let block = match self.run_block(index, attempt).await {
                Ok(block) => block,
                Err(e) => {
                    log::error!("block {index} could not be finalized: {e}");
                    break Some(EarlyExit::Aborted);
                }
            };

            self.persist(PendingWrite::Block(Box::new(block.clone())));
            if let Some(observer) = self.observer.as_mut() {
                observer(&block);
            }
            session.record_block(&block);
            let stop = block.stop_reason.clone();
            blocks.push(block);

            match stop {
                StopReason::Completed | StopReason::Timeout => {
                    index += 1;
                    attempt = 1;
                }
                StopReason::Invalidated { .. } => {
                    if attempt >= self.config.max_block_attempts {
                        log::warn!("block {index} invalidated on all {attempt} attempts");
                        break Some(EarlyExit::RedoLimit {
                            index,
                            attempts: attempt,
                        });
                    }
                    attempt += 1;
                    log::info!("redoing block {index} (attempt {attempt})");
                }
                StopReason::Aborted => break Some(EarlyExit::Aborted),
            }
        };

        let summary = session.summary(early_exit);
        self.persist(PendingWrite::Complete(summary.clone()));
        match &summary.early_exit {
            Some(reason) => log::info!("session {} ended early: {reason}", self.meta.id),
            None => log::info!(
                "session {} complete: {} trials over {} blocks",
                self.meta.id,
                summary.trials,
                summary.blocks_completed
            ),
        }
        SessionOutcome {
            session_id: self.meta.id.clone(),
            summary,
            blocks,
            session,
            pending_writes: self.backlog.len(),
        }
    }

    async fn run_block(&mut self, index: usize, attempt: u32) -> Result<Block, SchedulerError> {
        let config = &self.config;
        let hint = config.block_duration() + config.grace();
        let mut conn = connect_with_retry(&mut self.source, hint, &config.retry).await;

        let mut scheduler = TrialScheduler::new(
            config,
            self.meta.target,
            index,
            attempt,
            self.fallback.fork(),
        );
        if conn.is_fallback() {
            scheduler.use_fallback();
        }
        let mut buffer = StreamBuffer::new();
        let mut abort_rx = self.abort.subscribe();
        let mut abort_open = true;
        let mut failures = 0u32;

        let origin = Instant::now();
        scheduler.start(Duration::ZERO)?;
        if self.abort.is_aborted() {
            scheduler.stop(Duration::ZERO)?;
        }
        let mut clock = interval(config.tick_period());
        clock.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !scheduler.is_finished() {
            tokio::select! {
                biased;

                changed = abort_rx.changed(), if abort_open => match changed {
                    Ok(()) => {
                        if *abort_rx.borrow_and_update() {
                            scheduler.stop(origin.elapsed())?;
                        }
                    }
                    Err(_) => abort_open = false,
                },

                event = conn.recv(), if conn.is_live() => match event {
                    Some(SourceEvent::Chunk(chunk)) => {
                        match validate_chunk(&chunk, config.min_chunk_units) {
                            Ok(()) => {
                                buffer.push(chunk);
                            }
                            Err(e) => {
                                failures += 1;
                                log::warn!("block {index}: discarded chunk ({e}), failure {failures}");
                                if failures > config.retry.max_attempts {
                                    self.source.disconnect();
                                    conn = connect_with_retry(&mut self.source, hint, &config.retry).await;
                                    failures = 0;
                                }
                            }
                        }
                    }
                    Some(SourceEvent::Complete) => {
                        log::debug!("block {index}: source complete");
                        conn = Connection::Closed;
                    }
                    None => {
                        failures += 1;
                        log::warn!("block {index}: source disconnected, failure {failures}");
                        self.source.disconnect();
                        conn = if failures > config.retry.max_attempts {
                            Connection::Fallback
                        } else {
                            connect_with_retry(&mut self.source, hint, &config.retry).await
                        };
                    }
                },

                _ = clock.tick() => {
                    scheduler.tick(origin.elapsed(), &mut buffer);
                }
            }
            // Fallback lasts for the rest of the block whichever side chose it.
            if conn.is_fallback() {
                scheduler.use_fallback();
            } else if scheduler.is_fallback() && conn.is_live() {
                self.source.disconnect();
                conn = Connection::Fallback;
            }
        }

        self.source.disconnect();
        scheduler.finalize(origin.elapsed())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist(&mut self, write: PendingWrite) {
        self.backlog.push_back(write);
        self.flush_pending();
    }

    /// Retry queued writes in order. Returns how many remain queued.
    pub fn flush_pending(&mut self) -> usize {
        let queued = self.backlog.len();
        while let Some(write) = self.backlog.front() {
            if let Err(e) = apply(&mut self.store, &self.handle, write) {
                log::warn!(
                    "session {}: write failed, {} record(s) kept in memory: {e}",
                    self.handle.id,
                    self.backlog.len()
                );
                break;
            }
            self.backlog.pop_front();
        }
        let flushed = queued - self.backlog.len();
        if queued > 1 && flushed > 0 {
            log::info!(
                "session {}: flushed {flushed} backlogged record(s)",
                self.handle.id
            );
        }
        self.backlog.len()
    }
}

fn apply<T: SessionStore>(
    store: &mut T,
    handle: &SessionHandle,
    write: &PendingWrite,
) -> Result<(), StoreError> {
    match write {
        PendingWrite::Create(meta) => store.create_session(meta).map(|_| ()),
        PendingWrite::Block(block) => store.append_block(handle, block),
        PendingWrite::Complete(summary) => store.complete_session(handle, summary),
    }
}
