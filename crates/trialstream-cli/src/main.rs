//! CLI for trialstream — fixed-rate binary trials over a live random-bit stream.

mod commands;
mod sim;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trialstream")]
#[command(about = "trialstream — fixed-rate binary trials over a live random-bit stream")]
#[command(version = trialstream_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session of trial blocks and record it to disk.
    /// Ctrl+C stops the current block and closes the session.
    Run {
        /// JSON experiment config; flags below override its fields
        #[arg(long)]
        config: Option<String>,

        /// Number of blocks in the session
        #[arg(long)]
        blocks: Option<usize>,

        /// Trial cadence in Hz
        #[arg(long)]
        hz: Option<f64>,

        /// Nominal block length in milliseconds
        #[arg(long)]
        block_ms: Option<u64>,

        /// Drop the demon control channel
        #[arg(long)]
        no_demon: bool,

        /// Bit source: simulated (seeded pseudo-random) or fallback (local SHA-256 generator)
        #[arg(long, default_value = "simulated", value_parser = ["simulated", "fallback"])]
        source: String,

        /// Chance that a chunk arrives after a stall
        #[arg(long, default_value = "0.02")]
        stall_probability: f64,

        /// Units per delivered chunk
        #[arg(long, default_value = "64")]
        chunk_units: usize,

        /// Mean milliseconds between chunks
        #[arg(long, default_value = "250")]
        chunk_interval_ms: u64,

        /// Seed for the simulated delivery schedule
        #[arg(long)]
        seed: Option<u64>,

        /// Output directory for sessions
        #[arg(long, default_value = "sessions")]
        output: String,

        /// Session tag as key:value (repeatable)
        #[arg(long)]
        tag: Vec<String>,

        /// Free-form note stored with the session
        #[arg(long)]
        note: Option<String>,
    },

    /// List recorded sessions, or show one session in detail
    Sessions {
        /// Path to a single session directory
        session: Option<String>,

        /// Directory containing sessions
        #[arg(long, default_value = "sessions")]
        dir: String,
    },

    /// Pooled statistics across recorded sessions: hit rates, serial
    /// structure, cross-channel correlation, spectrum.
    Analyze {
        /// Directory containing sessions
        #[arg(long, default_value = "sessions")]
        dir: String,

        /// Write the full report as JSON
        #[arg(long)]
        output: Option<String>,

        /// Leave out blocks that drew any fallback trials
        #[arg(long)]
        exclude_fallback: bool,

        /// Null hit probability (defaults to 0.5)
        #[arg(long)]
        p0: Option<f64>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            blocks,
            hz,
            block_ms,
            no_demon,
            source,
            stall_probability,
            chunk_units,
            chunk_interval_ms,
            seed,
            output,
            tag,
            note,
        } => commands::run::run(commands::run::RunCommandConfig {
            config_path: config.as_deref(),
            blocks,
            hz,
            block_ms,
            no_demon,
            output: &output,
            source: &source,
            stall_probability,
            chunk_units,
            chunk_interval_ms,
            seed,
            tags: &tag,
            note: note.as_deref(),
        }),
        Commands::Sessions { session, dir } => commands::sessions::run(session.as_deref(), &dir),
        Commands::Analyze {
            dir,
            output,
            exclude_fallback,
            p0,
        } => commands::analyze::run(commands::analyze::AnalyzeCommandConfig {
            dir: &dir,
            output_path: output.as_deref(),
            exclude_fallback,
            p0,
        }),
    }
}
