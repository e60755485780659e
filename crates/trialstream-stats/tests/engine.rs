//! Integration tests for trialstream-stats.
//!
//! Blocks are produced by the real scheduler over prefilled buffers, then
//! reduced by the engine.

use std::time::Duration;

use trialstream_core::{
    BitChunk, Block, Channel, ExperimentConfig, FallbackSource, GovernorSettings,
    JsonSessionStore, Session, SessionMeta, SessionRecord, SessionStore, StreamBuffer,
    TargetAssignment, TrialScheduler, ValidatedConfig, load_sessions,
};
use trialstream_stats::StatisticsEngine;

fn config(demon: bool) -> ValidatedConfig {
    ExperimentConfig {
        cadence_hz: 10.0,
        block_duration_ms: 1_000,
        total_blocks: 20,
        demon_channel: demon,
        entropy_window_size: 32,
        governor: GovernorSettings {
            pause_threshold: 1,
            resume_threshold: 2,
            warmup_threshold: 2,
            warmup_timeout_ms: 1_000,
        },
        ..Default::default()
    }
    .validate()
    .unwrap()
}

fn lcg_bits(n: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) & 1) as u8
        })
        .collect()
}

/// Run one block to completion over `units`; target is 1.
fn run_block(config: &ValidatedConfig, index: usize, units: Vec<u8>) -> Block {
    let mut scheduler = TrialScheduler::new(
        config,
        TargetAssignment::fixed(1),
        index,
        1,
        FallbackSource::from_seed(b"stats"),
    );
    let mut buffer = StreamBuffer::new();
    if !units.is_empty() {
        buffer.push(BitChunk::new("lcg", units));
    } else {
        scheduler.use_fallback();
    }
    scheduler.start(Duration::ZERO).unwrap();
    let mut at = Duration::ZERO;
    while !scheduler.is_finished() {
        at += config.tick_period();
        scheduler.tick(at, &mut buffer);
    }
    scheduler.finalize(at).unwrap()
}

/// Units for a block whose subject and ghost draws are given per trial.
fn paired_units(subject: &[u8], ghost: &[u8]) -> Vec<u8> {
    let mut units: Vec<u8> = subject
        .iter()
        .zip(ghost)
        .flat_map(|(&s, &g)| [s, g])
        .collect();
    // Headroom so the last draws never sit below the pause threshold.
    units.extend([0, 0]);
    units
}

fn record(config: &ValidatedConfig, blocks: Vec<Block>) -> SessionRecord {
    let meta = SessionMeta::new(config, TargetAssignment::fixed(1), "lcg");
    let mut rec = SessionRecord::new(meta);
    rec.blocks = blocks;
    rec
}

fn random_blocks(config: &ValidatedConfig, n: usize, seed: u64) -> Vec<Block> {
    let per_block = config.planned_trial_count() * config.units_per_trial() + 4;
    (0..n)
        .map(|i| run_block(config, i, lcg_bits(per_block, seed + i as u64)))
        .collect()
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[test]
fn aggregates_match_block_stats() {
    let cfg = config(true);
    let blocks = random_blocks(&cfg, 20, 100);
    let subject_hits: usize = blocks.iter().map(|b| b.subject.hits).sum();
    let report = StatisticsEngine::new().analyze(&[record(&cfg, blocks)]);

    assert_eq!(report.sessions, 1);
    assert_eq!(report.blocks, 20);
    assert_eq!(report.trials, 200);
    assert_eq!(report.channels.len(), 3);
    let subject = report.channel(Channel::Subject).unwrap();
    assert_eq!(subject.hits, subject_hits);
    assert_eq!(subject.trials, 200);
    assert_eq!(subject.blocks, 20);
    assert!(subject.p > 0.0 && subject.p <= 1.0);
    assert_eq!(report.block_hit_rates.len(), 20);
    assert_eq!(report.autocorrelation.len(), 5);
    assert_eq!(report.cross_channel.len(), 3);
    assert!(report.runs.is_some());
    assert!(report.halves.is_some());
    assert!(report.spectral.is_some());
}

#[test]
fn sessions_are_pooled() {
    let cfg = config(false);
    let a = record(&cfg, random_blocks(&cfg, 5, 1));
    let b = record(&cfg, random_blocks(&cfg, 7, 50));
    let report = StatisticsEngine::new().analyze(&[a, b]);
    assert_eq!(report.sessions, 2);
    assert_eq!(report.blocks, 12);
    assert_eq!(report.trials, 120);
    assert!(report.channel(Channel::Demon).is_none());
    assert_eq!(report.cross_channel.len(), 1);
}

// ---------------------------------------------------------------------------
// Exclusions
// ---------------------------------------------------------------------------

#[test]
fn invalidated_blocks_are_excluded() {
    let cfg = config(false);
    let mut blocks = random_blocks(&cfg, 6, 7);
    blocks[2].invalidated = true;
    blocks[4].invalidated = true;
    let report = StatisticsEngine::new().analyze(&[record(&cfg, blocks)]);
    assert_eq!(report.invalidated_blocks, 2);
    assert_eq!(report.blocks, 4);
    assert_eq!(report.trials, 40);
}

#[test]
fn fallback_blocks_are_optional() {
    let cfg = config(false);
    let mut blocks = random_blocks(&cfg, 4, 9);
    blocks.push(run_block(&cfg, 4, Vec::new()));
    assert_eq!(blocks[4].fallback_trials, 10);
    let rec = [record(&cfg, blocks)];

    let included = StatisticsEngine::new().analyze(&rec);
    assert_eq!(included.blocks, 5);
    assert_eq!(included.fallback_trials, 10);
    assert_eq!(included.excluded_fallback_blocks, 0);

    let excluded = StatisticsEngine::new().exclude_fallback(true).analyze(&rec);
    assert_eq!(excluded.blocks, 4);
    assert_eq!(excluded.fallback_trials, 0);
    assert_eq!(excluded.excluded_fallback_blocks, 1);
}

// ---------------------------------------------------------------------------
// Structure detection
// ---------------------------------------------------------------------------

#[test]
fn alternating_blocks_show_serial_structure() {
    let cfg = config(false);
    let blocks: Vec<Block> = (0..20)
        .map(|i| {
            let bit = (i % 2) as u8;
            run_block(&cfg, i, paired_units(&[bit; 10], &lcg_bits(10, i as u64)))
        })
        .collect();
    let report = StatisticsEngine::new().analyze(&[record(&cfg, blocks)]);

    assert_eq!(report.block_hit_rates[..4], [0.0, 1.0, 0.0, 1.0]);
    assert!(report.significant_lags().contains(&1));
    assert!(report.autocorrelation[0].r < -0.9);

    let runs = report.runs.as_ref().unwrap();
    assert_eq!(runs.runs, 20);
    assert!(runs.z > 3.0);
    assert!(runs.p < 0.01);

    let tp = report.turning_points.as_ref().unwrap();
    assert_eq!(tp.count, 18);
    assert!((tp.expected - 9.0).abs() < 1e-12);

    let spectral = report.spectral.as_ref().unwrap();
    let dominant = spectral.dominant.as_ref().unwrap();
    assert!((dominant.frequency - 0.5).abs() < 1e-12);
}

#[test]
fn drifting_hit_rate_shows_in_halves() {
    let cfg = config(false);
    let blocks: Vec<Block> = (0..20)
        .map(|i| {
            let hits = if i < 10 { 3 } else { 8 };
            let subject: Vec<u8> = (0..10).map(|t| u8::from(t < hits)).collect();
            run_block(&cfg, i, paired_units(&subject, &lcg_bits(10, 40 + i as u64)))
        })
        .collect();
    let report = StatisticsEngine::new().analyze(&[record(&cfg, blocks)]);
    let halves = report.halves.unwrap();
    assert!((halves.first_mean - 0.3).abs() < 1e-12);
    assert!((halves.second_mean - 0.8).abs() < 1e-12);
    assert_eq!(halves.p, 0.0);
    assert!(halves.t.is_infinite() && halves.t < 0.0);
}

#[test]
fn coupled_channels_are_not_independent() {
    let cfg = config(false);
    let blocks: Vec<Block> = (0..10)
        .map(|i| {
            let bits = lcg_bits(10, 200 + i as u64);
            run_block(&cfg, i, paired_units(&bits, &bits))
        })
        .collect();
    let report = StatisticsEngine::new().analyze(&[record(&cfg, blocks)]);
    let pair = &report.cross_channel[0];
    assert_eq!((pair.a, pair.b), (Channel::Subject, Channel::Ghost));
    assert!(!pair.independent);
    let zero = pair.lags.iter().find(|l| l.lag == 0).unwrap();
    assert!((zero.r - 1.0).abs() < 1e-9);
}

#[test]
fn independent_channels_pass() {
    let cfg = config(false);
    let blocks = random_blocks(&cfg, 100, 1_000);
    let report = StatisticsEngine::new().analyze(&[record(&cfg, blocks)]);
    let pair = &report.cross_channel[0];
    assert_eq!(pair.trials, 1_000);
    let zero = pair.lags.iter().find(|l| l.lag == 0).unwrap();
    assert!(zero.r.abs() < 0.15, "r = {}", zero.r);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn analyzes_sessions_loaded_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(true);
    let mut store = JsonSessionStore::new(tmp.path());

    for seed in [1u64, 2] {
        let meta = SessionMeta::new(&cfg, TargetAssignment::fixed(1), "lcg");
        let handle = store.create_session(&meta).unwrap();
        let mut session = Session::new(&meta, &cfg);
        for block in random_blocks(&cfg, 3, seed * 10) {
            session.record_block(&block);
            store.append_block(&handle, &block).unwrap();
        }
        store
            .complete_session(&handle, &session.summary(None))
            .unwrap();
    }

    let sessions = load_sessions(tmp.path()).unwrap();
    assert_eq!(sessions.len(), 2);
    let report = StatisticsEngine::new().analyze(&sessions);
    assert_eq!(report.blocks, 6);
    assert_eq!(report.trials, 60);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["blocks"], 6);
    assert_eq!(json["channels"][0]["channel"], "subject");
    assert!(json["autocorrelation"].is_array());
}
