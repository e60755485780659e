//! Sessions: metadata, in-memory aggregation and persistence.
//!
//! # Storage Format
//!
//! [`JsonSessionStore`] writes one directory per session,
//! `{started-at, compact}-{short id}`, containing:
//! - `session.json` — metadata (target, config snapshot, machine info, tags)
//! - `blocks.jsonl` — one [`Block`] per line, append-only, every attempt
//!   including invalidated ones
//! - `summary.json` — the [`SessionSummary`], written on completion

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::analysis::binomial_test;
use crate::block::{Block, StopReason};
use crate::config::{ExperimentConfig, ValidatedConfig};
use crate::trial::{Channel, TargetAssignment};
use crate::windower::{ChannelWindow, ChannelWindowers};

pub const SESSION_FILE: &str = "session.json";
pub const BLOCKS_FILE: &str = "blocks.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown session {0}")]
    UnknownSession(String),
}

// ---------------------------------------------------------------------------
// Machine info
// ---------------------------------------------------------------------------

/// Machine information captured at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os: String,
    pub arch: String,
    pub cores: usize,
}

/// Detect machine information (best-effort).
pub fn detect_machine_info() -> MachineInfo {
    let os = match os_version() {
        Some(v) => format!("{} {v}", std::env::consts::OS),
        None => std::env::consts::OS.to_string(),
    };
    MachineInfo {
        os,
        arch: std::env::consts::ARCH.to_string(),
        cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

fn os_version() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        fs::read_to_string("/etc/os-release").ok().and_then(|s| {
            s.lines()
                .find_map(|l| l.strip_prefix("PRETTY_NAME="))
                .map(|v| v.trim_matches('"').to_string())
        })
    }
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

// ---------------------------------------------------------------------------
// Session metadata (session.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub version: u32,
    pub id: String,
    pub started_at: String,
    pub target: TargetAssignment,
    /// Label of the remote source the session was run against.
    pub source: String,
    pub config: ExperimentConfig,
    pub planned_trials_per_block: usize,
    pub machine: MachineInfo,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
    pub trialstream_version: String,
}

impl SessionMeta {
    pub fn new(config: &ValidatedConfig, target: TargetAssignment, source: &str) -> Self {
        Self {
            version: 1,
            id: Uuid::new_v4().to_string(),
            started_at: now_iso8601(),
            target,
            source: source.to_string(),
            config: config.as_config().clone(),
            planned_trials_per_block: config.planned_trial_count(),
            machine: detect_machine_info(),
            tags: HashMap::new(),
            note: None,
            trialstream_version: crate::VERSION.to_string(),
        }
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    /// Directory name used by [`JsonSessionStore`].
    pub fn dir_name(&self) -> String {
        let short: String = self.id.chars().filter(|c| *c != '-').take(8).collect();
        format!("{}-{short}", self.started_at.replace(':', ""))
    }
}

/// Opaque reference to a session inside a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: String,
}

// ---------------------------------------------------------------------------
// Summary (summary.json)
// ---------------------------------------------------------------------------

/// Why a session ended before all planned blocks were done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EarlyExit {
    Aborted,
    /// Block `index` was invalidated on every allowed attempt.
    RedoLimit { index: usize, attempts: u32 },
}

impl std::fmt::Display for EarlyExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::RedoLimit { index, attempts } => {
                write!(f, "block {index} invalidated {attempts} times")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel: Channel,
    pub hits: usize,
    pub trials: usize,
    pub hit_rate: f64,
    pub z: f64,
    pub p: f64,
    pub windows: u64,
    pub mean_window_entropy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub ended_at: String,
    pub blocks_planned: usize,
    pub blocks_completed: usize,
    /// Valid blocks with fewer trials than planned.
    pub truncated_blocks: usize,
    pub trials: usize,
    pub channels: Vec<ChannelSummary>,
    pub fallback_trials: usize,
    pub invalidated_attempts: usize,
    pub early_exit: Option<EarlyExit>,
}

impl SessionSummary {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelSummary> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

// ---------------------------------------------------------------------------
// In-memory session
// ---------------------------------------------------------------------------

/// Running aggregate of one session.
///
/// Only valid blocks count toward totals and entropy windows. The windowers
/// are touched only here, between blocks.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    target: TargetAssignment,
    p0: f64,
    planned_blocks: usize,
    channels: Vec<Channel>,
    blocks: Vec<Block>,
    windowers: ChannelWindowers,
    windows: Vec<ChannelWindow>,
    invalidated_attempts: usize,
}

impl Session {
    pub fn new(meta: &SessionMeta, config: &ValidatedConfig) -> Self {
        let mut channels = vec![Channel::Subject, Channel::Ghost];
        if config.demon_channel {
            channels.push(Channel::Demon);
        }
        Self {
            id: meta.id.clone(),
            target: meta.target,
            p0: config.null_hit_probability,
            planned_blocks: config.total_blocks,
            channels,
            blocks: Vec::new(),
            windowers: ChannelWindowers::new(config.entropy_window_size, config.demon_channel),
            windows: Vec::new(),
            invalidated_attempts: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> TargetAssignment {
        self.target
    }

    /// Fold a finished block in. Returns the entropy windows it completed.
    pub fn record_block(&mut self, block: &Block) -> Vec<ChannelWindow> {
        if block.invalidated {
            self.invalidated_attempts += 1;
            return Vec::new();
        }
        let windows = self.windowers.feed_block(block);
        self.windows.extend(windows.iter().cloned());
        self.blocks.push(block.clone());
        windows
    }

    /// Valid blocks, in the order they ran.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn windows(&self) -> &[ChannelWindow] {
        &self.windows
    }

    pub fn windowers(&self) -> &ChannelWindowers {
        &self.windowers
    }

    pub fn total_trials(&self) -> usize {
        self.blocks.iter().map(|b| b.trials.len()).sum()
    }

    /// Cumulative `(hits, trials)` for a channel.
    pub fn channel_totals(&self, channel: Channel) -> (usize, usize) {
        self.blocks
            .iter()
            .filter_map(|b| b.channel(channel))
            .fold((0, 0), |(h, n), s| (h + s.hits, n + s.trials))
    }

    pub fn summary(&self, early_exit: Option<EarlyExit>) -> SessionSummary {
        let channels = self
            .channels
            .iter()
            .map(|&channel| {
                let (hits, trials) = self.channel_totals(channel);
                let test = binomial_test(hits, trials, self.p0);
                let entropies: Vec<f64> = self
                    .windows
                    .iter()
                    .filter(|w| w.channel == channel)
                    .map(|w| w.window.entropy)
                    .collect();
                ChannelSummary {
                    channel,
                    hits,
                    trials,
                    hit_rate: test.hit_rate(),
                    z: test.z,
                    p: test.p,
                    windows: entropies.len() as u64,
                    mean_window_entropy: (!entropies.is_empty())
                        .then(|| entropies.iter().sum::<f64>() / entropies.len() as f64),
                }
            })
            .collect();

        SessionSummary {
            session_id: self.id.clone(),
            ended_at: now_iso8601(),
            blocks_planned: self.planned_blocks,
            blocks_completed: self
                .blocks
                .iter()
                .filter(|b| b.stop_reason != StopReason::Aborted)
                .count(),
            truncated_blocks: self.blocks.iter().filter(|b| b.is_truncated()).count(),
            trials: self.total_trials(),
            channels,
            fallback_trials: self.blocks.iter().map(|b| b.fallback_trials).sum(),
            invalidated_attempts: self.invalidated_attempts,
            early_exit,
        }
    }
}

// ---------------------------------------------------------------------------
// Stored sessions
// ---------------------------------------------------------------------------

/// A session as read back from a store.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub meta: SessionMeta,
    /// Every attempt, in append order.
    pub blocks: Vec<Block>,
    pub summary: Option<SessionSummary>,
    pub dir: Option<PathBuf>,
}

impl SessionRecord {
    pub fn new(meta: SessionMeta) -> Self {
        Self {
            meta,
            blocks: Vec::new(),
            summary: None,
            dir: None,
        }
    }

    pub fn valid_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_valid())
    }

    pub fn is_complete(&self) -> bool {
        self.summary.is_some()
    }
}

/// Where sessions go. Each block index is appended whole; nothing already
/// appended is ever modified.
pub trait SessionStore {
    fn create_session(&mut self, meta: &SessionMeta) -> Result<SessionHandle, StoreError>;
    fn append_block(&mut self, handle: &SessionHandle, block: &Block) -> Result<(), StoreError>;
    fn complete_session(
        &mut self,
        handle: &SessionHandle,
        summary: &SessionSummary,
    ) -> Result<(), StoreError>;
}

/// Directory-per-session JSON store.
#[derive(Debug)]
pub struct JsonSessionStore {
    root: PathBuf,
    dirs: HashMap<String, PathBuf>,
}

impl JsonSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirs: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, handle: &SessionHandle) -> Option<&Path> {
        self.dirs.get(&handle.id).map(PathBuf::as_path)
    }

    fn dir_for(&self, handle: &SessionHandle) -> Result<&Path, StoreError> {
        self.session_dir(handle)
            .ok_or_else(|| StoreError::UnknownSession(handle.id.clone()))
    }
}

impl SessionStore for JsonSessionStore {
    fn create_session(&mut self, meta: &SessionMeta) -> Result<SessionHandle, StoreError> {
        let dir = self.root.join(meta.dir_name());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(SESSION_FILE), serde_json::to_string_pretty(meta)?)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(BLOCKS_FILE))?;
        log::info!("session {} created at {}", meta.id, dir.display());
        self.dirs.insert(meta.id.clone(), dir);
        Ok(SessionHandle {
            id: meta.id.clone(),
        })
    }

    fn append_block(&mut self, handle: &SessionHandle, block: &Block) -> Result<(), StoreError> {
        let line = serde_json::to_string(block)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir_for(handle)?.join(BLOCKS_FILE))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    fn complete_session(
        &mut self,
        handle: &SessionHandle,
        summary: &SessionSummary,
    ) -> Result<(), StoreError> {
        let path = self.dir_for(handle)?.join(SUMMARY_FILE);
        fs::write(path, serde_json::to_string_pretty(summary)?)?;
        Ok(())
    }
}

/// In-process store. Can be told to fail every write.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: HashMap<String, SessionRecord>,
    failing: bool,
    failed_writes: usize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn failed_writes(&self) -> usize {
        self.failed_writes
    }

    pub fn session(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sessions.values()
    }

    fn check(&mut self) -> Result<(), StoreError> {
        if self.failing {
            self.failed_writes += 1;
            return Err(StoreError::Io(std::io::Error::other("store unavailable")));
        }
        Ok(())
    }

    fn record_mut(&mut self, handle: &SessionHandle) -> Result<&mut SessionRecord, StoreError> {
        self.sessions
            .get_mut(&handle.id)
            .ok_or_else(|| StoreError::UnknownSession(handle.id.clone()))
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&mut self, meta: &SessionMeta) -> Result<SessionHandle, StoreError> {
        self.check()?;
        self.sessions
            .insert(meta.id.clone(), SessionRecord::new(meta.clone()));
        Ok(SessionHandle {
            id: meta.id.clone(),
        })
    }

    fn append_block(&mut self, handle: &SessionHandle, block: &Block) -> Result<(), StoreError> {
        self.check()?;
        self.record_mut(handle)?.blocks.push(block.clone());
        Ok(())
    }

    fn complete_session(
        &mut self,
        handle: &SessionHandle,
        summary: &SessionSummary,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.record_mut(handle)?.summary = Some(summary.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read one session directory.
pub fn load_session(dir: &Path) -> Result<SessionRecord, StoreError> {
    let meta: SessionMeta = serde_json::from_str(&fs::read_to_string(dir.join(SESSION_FILE))?)?;
    let mut record = SessionRecord::new(meta);

    let blocks_path = dir.join(BLOCKS_FILE);
    if blocks_path.exists() {
        for line in fs::read_to_string(blocks_path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            record.blocks.push(serde_json::from_str(line)?);
        }
    }

    let summary_path = dir.join(SUMMARY_FILE);
    if summary_path.exists() {
        record.summary = Some(serde_json::from_str(&fs::read_to_string(summary_path)?)?);
    }
    record.dir = Some(dir.to_path_buf());
    Ok(record)
}

/// Read every session under `root`, oldest first.
///
/// Directories without a `session.json` are ignored; unreadable sessions are
/// logged and skipped. A missing root yields no sessions.
pub fn load_sessions(root: &Path) -> Result<Vec<SessionRecord>, StoreError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.join(SESSION_FILE).is_file() {
            continue;
        }
        match load_session(&path) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("skipping {}: {e}", path.display()),
        }
    }
    records.sort_by(|a, b| a.meta.started_at.cmp(&b.meta.started_at));
    Ok(records)
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

pub(crate) fn now_iso8601() -> String {
    format_iso8601(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    )
}

/// `2026-02-15T01:30:00Z`
pub(crate) fn format_iso8601(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3_600,
        rem / 60 % 60,
        rem % 60
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
