//! `trialstream run`: run a session of trial blocks against a simulated source.

use std::path::Path;

use tokio::runtime::Runtime;
use trialstream_core::{
    Block, Channel, ConfigError, EntropySource, ExperimentConfig, FallbackSource,
    JsonSessionStore, SessionHandle, SessionMeta, SessionRunner, SessionSummary, TargetAssignment,
    ValidatedConfig,
};

use super::{format_duration_ms, format_score};
use crate::sim::{SimSettings, SimulatedSource};

pub struct RunCommandConfig<'a> {
    pub config_path: Option<&'a str>,
    pub blocks: Option<usize>,
    pub hz: Option<f64>,
    pub block_ms: Option<u64>,
    pub no_demon: bool,
    pub output: &'a str,
    pub source: &'a str,
    pub stall_probability: f64,
    pub chunk_units: usize,
    pub chunk_interval_ms: u64,
    pub seed: Option<u64>,
    pub tags: &'a [String],
    pub note: Option<&'a str>,
}

/// Run the run command.
pub fn run(args: RunCommandConfig<'_>) {
    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    let target = match TargetAssignment::draw(&config.allowed_targets) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to draw target: {e}");
            std::process::exit(1);
        }
    };
    let mut fallback = match FallbackSource::from_os() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to seed fallback generator: {e}");
            std::process::exit(1);
        }
    };
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let sim = SimSettings {
        chunk_units: args.chunk_units,
        chunk_interval_ms: args.chunk_interval_ms,
        stall_probability: args.stall_probability,
        ..SimSettings::default()
    };
    let seed = args.seed.unwrap_or_else(rand::random);

    let code = if args.source == "fallback" {
        let generator = fallback.fork();
        let source = SimulatedSource::local(sim, seed, generator);
        execute(&args, config, target, source, fallback, &runtime)
    } else {
        let source = SimulatedSource::new(sim, seed);
        execute(&args, config, target, source, fallback, &runtime)
    };
    if code != 0 {
        std::process::exit(code);
    }
}

/// Defaults, then the JSON file, then flags.
fn build_config(args: &RunCommandConfig<'_>) -> Result<ValidatedConfig, ConfigError> {
    let mut config = match args.config_path {
        Some(path) => ExperimentConfig::from_json_path(Path::new(path))?,
        None => ExperimentConfig::default(),
    };
    if let Some(blocks) = args.blocks {
        config.total_blocks = blocks;
    }
    if let Some(hz) = args.hz {
        config.cadence_hz = hz;
    }
    if let Some(ms) = args.block_ms {
        config.block_duration_ms = ms;
    }
    if args.no_demon {
        config.demon_channel = false;
    }
    config.validate()
}

fn execute<S: EntropySource>(
    args: &RunCommandConfig<'_>,
    config: ValidatedConfig,
    target: TargetAssignment,
    source: S,
    fallback: FallbackSource,
    runtime: &Runtime,
) -> i32 {
    let meta = SessionMeta::new(&config, target, source.label())
        .with_tags(super::parse_tags(args.tags))
        .with_note(args.note.map(str::to_string));

    println!("Running session {}", meta.id);
    println!("  Target:    {}", target.value);
    println!(
        "  Blocks:    {} x {} trials at {} Hz ({} each)",
        config.total_blocks,
        config.planned_trial_count(),
        config.cadence_hz,
        format_duration_ms(config.block_duration_ms)
    );
    println!(
        "  Channels:  subject, ghost{}",
        if config.demon_channel { ", demon" } else { "" }
    );
    println!("  Source:    {}", source.label());
    println!("  Output:    {}/", args.output);
    println!();

    let store = JsonSessionStore::new(args.output);
    let mut runner = SessionRunner::new(config, meta, source, store, fallback).on_block(print_block);

    let abort = runner.abort_handle();
    if let Err(e) = ctrlc::set_handler(move || abort.abort()) {
        log::warn!("Ctrl+C handler unavailable: {e}");
    }

    let outcome = runtime.block_on(runner.run());

    let mut code = 0;
    if outcome.pending_writes > 0 {
        let left = runner.flush_pending();
        if left > 0 {
            eprintln!("\n{left} record(s) could not be written to {}", args.output);
            code = 1;
        }
    }

    print_summary(&outcome.summary);
    let handle = SessionHandle {
        id: outcome.session_id.clone(),
    };
    if let Some(dir) = runner.store().session_dir(&handle) {
        println!("\nSession saved to {}", dir.display());
        println!("  session.json  — metadata, target and config");
        println!("  blocks.jsonl  — one record per block attempt");
        println!("  summary.json  — totals and early-exit reason");
    }
    code
}

fn print_block(block: &Block) {
    let mut line = format!(
        "  block {:>3} #{}  {:>4}/{:<4}",
        block.index,
        block.attempt,
        block.trials.len(),
        block.planned_trial_count
    );
    for channel in block.channels() {
        if let Some(s) = block.channel(channel) {
            line.push_str(&format!(
                "  {channel} {}",
                format_score(s.hit_rate, s.z, s.p)
            ));
        }
    }
    if block.pause_count > 0 {
        line.push_str(&format!(
            "  pauses {} ({})",
            block.pause_count,
            format_duration_ms(block.total_paused_ms)
        ));
    }
    if block.fallback_trials > 0 {
        line.push_str(&format!("  fallback {}", block.fallback_trials));
    }
    line.push_str(&format!("  {}", block.stop_reason));
    println!("{line}");
}

fn print_summary(summary: &SessionSummary) {
    println!();
    match &summary.early_exit {
        Some(reason) => println!("Session ended early: {reason}"),
        None => println!("Session complete"),
    }
    println!(
        "  Blocks:      {}/{} ({} truncated, {} invalidated attempts)",
        summary.blocks_completed,
        summary.blocks_planned,
        summary.truncated_blocks,
        summary.invalidated_attempts
    );
    println!("  Trials:      {}", summary.trials);
    if summary.fallback_trials > 0 {
        println!("  Fallback:    {} trials", summary.fallback_trials);
    }
    for channel in [Channel::Subject, Channel::Ghost, Channel::Demon] {
        if let Some(c) = summary.channel(channel) {
            let entropy = c
                .mean_window_entropy
                .map(|h| format!(", {} windows, mean H={h:.4}", c.windows))
                .unwrap_or_default();
            println!(
                "  {:<12} {}{entropy}",
                format!("{channel}:"),
                format_score(c.hit_rate, c.z, c.p)
            );
        }
    }
}
