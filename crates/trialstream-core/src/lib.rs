//! # trialstream-core
//!
//! Real-time consumption of a remote random-bit stream by a fixed-rate trial
//! clock.
//!
//! ## Quick Start
//!
//! ```no_run
//! use trialstream_core::{
//!     ExperimentConfig, FallbackSource, MemorySessionStore, SessionMeta, SessionRunner,
//!     TargetAssignment,
//! };
//! # async fn demo<S: trialstream_core::EntropySource>(source: S) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExperimentConfig::default().validate()?;
//! let target = TargetAssignment::draw(&config.allowed_targets)?;
//! let meta = SessionMeta::new(&config, target, source.label());
//! let mut runner = SessionRunner::new(
//!     config,
//!     meta,
//!     source,
//!     MemorySessionStore::new(),
//!     FallbackSource::from_os()?,
//! );
//! let outcome = runner.run().await;
//! println!("{} trials", outcome.summary.trials);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Source → StreamBuffer → BufferGovernor (gate) → TrialScheduler → Block
//! → EntropyWindower → SessionStore
//!
//! The buffer, governor and scheduler are plain owned state machines, one
//! triple per block. [`SessionRunner`] wires them to a tokio timer and the
//! source's channel. Cross-session statistics live in `trialstream-stats`.

pub mod analysis;
pub mod block;
pub mod buffer;
pub mod conditioning;
pub mod config;
pub mod governor;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod trial;
pub mod windower;

pub use block::{Block, ChannelStats, StopReason};
pub use buffer::{BitChunk, BufferError, StreamBuffer, Unit};
pub use config::{
    ConfigError, ExperimentConfig, GovernorSettings, Guardrails, RetryPolicy, ValidatedConfig,
};
pub use governor::{BufferGovernor, GovernorState, InvalidReason, PauseStats, Transition};
pub use runner::{AbortHandle, SessionOutcome, SessionRunner};
pub use scheduler::{SchedulerError, SchedulerState, SkipReason, TickOutcome, TrialScheduler};
pub use session::{
    EarlyExit, JsonSessionStore, MemorySessionStore, Session, SessionHandle, SessionMeta,
    SessionRecord, SessionStore, SessionSummary, StoreError, load_session, load_sessions,
};
pub use source::{
    Connection, EntropySource, FALLBACK_LABEL, FallbackSource, SourceError, SourceEvent,
    connect_with_retry,
};
pub use trial::{Channel, ChannelStrategy, TargetAssignment, TrialOutcome};
pub use windower::{ChannelWindow, EntropyWindow, EntropyWindower};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
