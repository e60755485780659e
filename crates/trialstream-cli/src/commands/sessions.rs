//! `trialstream sessions` — list recorded sessions or show one in detail.

use std::path::{Path, PathBuf};

use trialstream_core::{Channel, SessionRecord, load_session, load_sessions};

use super::{format_duration_ms, format_score, truncate};

/// Run the sessions command.
pub fn run(session_path: Option<&str>, dir: &str) {
    match session_path {
        Some(path) => {
            let session_dir = PathBuf::from(path);
            if !session_dir.join("session.json").exists() {
                eprintln!("Not a session directory: {path}");
                eprintln!("Expected session.json in that directory.");
                std::process::exit(1);
            }
            match load_session(&session_dir) {
                Ok(record) => show_session(&session_dir, &record),
                Err(e) => {
                    eprintln!("Failed to read session {path}: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => list_sessions(dir),
    }
}

fn list_sessions(dir: &str) {
    let mut sessions = match load_sessions(Path::new(dir)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read {dir}: {e}");
            std::process::exit(1);
        }
    };
    if sessions.is_empty() {
        println!("No sessions found in {dir}/");
        println!("Run a session first: trialstream run");
        return;
    }

    // Newest first
    sessions.reverse();

    println!(
        "{:<40} {:<10} {:>6} {:>7} {:>8}  Subject",
        "Session", "Source", "Target", "Blocks", "Trials"
    );
    println!("{}", "-".repeat(110));

    for record in &sessions {
        let dir_name = record
            .dir
            .as_ref()
            .and_then(|d| d.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| record.meta.id.clone());
        let (blocks, trials, subject) = match &record.summary {
            Some(s) => (
                format!("{}/{}", s.blocks_completed, s.blocks_planned),
                s.trials.to_string(),
                s.channel(Channel::Subject)
                    .map(|c| format_score(c.hit_rate, c.z, c.p))
                    .unwrap_or_default(),
            ),
            None => (
                format!("{}/{}", record.valid_blocks().count(), record.meta.config.total_blocks),
                record
                    .valid_blocks()
                    .map(|b| b.trials.len())
                    .sum::<usize>()
                    .to_string(),
                "[incomplete]".to_string(),
            ),
        };
        println!(
            "{:<40} {:<10} {:>6} {:>7} {:>8}  {subject}",
            truncate(&dir_name, 40),
            truncate(&record.meta.source, 10),
            record.meta.target.value,
            blocks,
            trials,
        );
    }

    println!("\n{} session(s) in {dir}/", sessions.len());
    println!("Run: trialstream sessions <path>  for per-block detail");
}

fn show_session(session_dir: &Path, record: &SessionRecord) {
    let meta = &record.meta;
    println!("Session: {}", session_dir.display());
    println!("  ID:        {}", meta.id);
    println!("  Started:   {}", meta.started_at);
    println!("  Target:    {}", meta.target.value);
    println!("  Source:    {}", meta.source);
    println!(
        "  Plan:      {} blocks x {} trials at {} Hz",
        meta.config.total_blocks, meta.planned_trials_per_block, meta.config.cadence_hz
    );
    println!(
        "  Machine:   {} ({}, {} cores)",
        meta.machine.os, meta.machine.arch, meta.machine.cores
    );
    println!("  Version:   {}", meta.trialstream_version);
    if !meta.tags.is_empty() {
        let mut tags: Vec<String> = meta.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        tags.sort();
        println!("  Tags:      {}", tags.join(", "));
    }
    if let Some(note) = &meta.note {
        println!("  Note:      {note}");
    }

    if !record.blocks.is_empty() {
        println!(
            "\n  {:>5} {:>3} {:>7} {:>24} {:>6} {:>8} {:>8}  Status",
            "Block", "#", "Trials", "Subject", "Pauses", "Paused", "Elapsed"
        );
        println!("  {}", "-".repeat(90));
        for block in &record.blocks {
            println!(
                "  {:>5} {:>3} {:>7} {:>24} {:>6} {:>8} {:>8}  {}",
                block.index,
                block.attempt,
                block.trials.len(),
                format_score(block.subject.hit_rate, block.subject.z, block.subject.p),
                block.pause_count,
                format_duration_ms(block.total_paused_ms),
                format_duration_ms(block.elapsed_ms),
                block.stop_reason,
            );
        }
    }

    match &record.summary {
        Some(summary) => {
            println!();
            println!("  Ended:     {}", summary.ended_at);
            println!(
                "  Blocks:    {}/{} ({} truncated, {} invalidated attempts)",
                summary.blocks_completed,
                summary.blocks_planned,
                summary.truncated_blocks,
                summary.invalidated_attempts
            );
            println!("  Trials:    {}", summary.trials);
            if summary.fallback_trials > 0 {
                println!("  Fallback:  {} trials", summary.fallback_trials);
            }
            if let Some(reason) = &summary.early_exit {
                println!("  Ended early: {reason}");
            }
            for c in &summary.channels {
                println!(
                    "  {:<10} {}",
                    format!("{}:", c.channel),
                    format_score(c.hit_rate, c.z, c.p)
                );
            }
        }
        None => println!("\n  No summary.json; the session did not finish."),
    }
}
