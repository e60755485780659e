//! `trialstream analyze` — pooled statistics over recorded sessions.

use std::path::Path;

use trialstream_core::load_sessions;
use trialstream_stats::{AnalysisReport, StatisticsEngine};

use super::format_score;

pub struct AnalyzeCommandConfig<'a> {
    pub dir: &'a str,
    pub output_path: Option<&'a str>,
    pub exclude_fallback: bool,
    pub p0: Option<f64>,
}

pub fn run(cfg: AnalyzeCommandConfig<'_>) {
    let sessions = match load_sessions(Path::new(cfg.dir)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", cfg.dir);
            std::process::exit(1);
        }
    };
    if sessions.is_empty() {
        eprintln!("No sessions found in {}/", cfg.dir);
        std::process::exit(1);
    }

    let mut engine = StatisticsEngine::new().exclude_fallback(cfg.exclude_fallback);
    if let Some(p0) = cfg.p0 {
        engine = engine.with_p0(p0);
    }
    let report = engine.analyze(&sessions);
    print_report(&report);

    if let Some(path) = cfg.output_path {
        super::write_json(&report, path, "Analysis");
    }
}

fn print_report(report: &AnalysisReport) {
    println!(
        "Analyzed {} session(s): {} blocks, {} trials (p0 = {})",
        report.sessions, report.blocks, report.trials, report.p0
    );
    if report.invalidated_blocks > 0 {
        println!("  {} invalidated attempt(s) excluded", report.invalidated_blocks);
    }
    if report.excluded_fallback_blocks > 0 {
        println!(
            "  {} fallback block(s) excluded",
            report.excluded_fallback_blocks
        );
    } else if report.fallback_trials > 0 {
        println!("  {} fallback trial(s) included", report.fallback_trials);
    }

    println!("\nChannels");
    println!("{}", "-".repeat(64));
    println!(
        "  {:<8} {:>8} {:>8}  {:<24} {:>7}",
        "Channel", "Hits", "Trials", "Score", "Blocks"
    );
    for c in &report.channels {
        println!(
            "  {:<8} {:>8} {:>8}  {:<24} {:>7}",
            c.channel.to_string(),
            c.hits,
            c.trials,
            format_score(c.hit_rate, c.z, c.p),
            c.blocks
        );
    }

    if report.block_hit_rates.len() < 3 {
        println!("\nToo few blocks for serial analysis.");
        return;
    }

    println!("\nSerial structure (subject hit rate per block)");
    println!("{}", "-".repeat(64));
    for lag in &report.autocorrelation {
        println!(
            "  lag {:<2} r={:+.4} t={:+.2}{}",
            lag.lag,
            lag.r,
            lag.t,
            if lag.significant { "  *" } else { "" }
        );
    }
    if let Some(runs) = &report.runs {
        println!(
            "  runs      {} (expected {:.1}) z={:+.2} p={:.3}",
            runs.runs, runs.expected_runs, runs.z, runs.p
        );
    }
    if let Some(tp) = &report.turning_points {
        println!(
            "  turning   {} (expected {:.1}, ratio {:.2})",
            tp.count, tp.expected, tp.ratio
        );
    }
    if let Some(h) = &report.halves {
        println!(
            "  halves    {:.4} vs {:.4} t={:+.2} p={:.3}",
            h.first_mean, h.second_mean, h.t, h.p
        );
    }

    if !report.cross_channel.is_empty() {
        println!("\nCross-channel");
        println!("{}", "-".repeat(64));
        for pair in &report.cross_channel {
            let strongest = pair
                .lags
                .iter()
                .max_by(|x, y| x.r.abs().total_cmp(&y.r.abs()));
            let detail = strongest
                .map(|l| format!("max |r| {:.4} at lag {:+}", l.r.abs(), l.lag))
                .unwrap_or_default();
            println!(
                "  {}/{:<8} {:>7} trials  {detail}  {}",
                pair.a,
                pair.b.to_string(),
                pair.trials,
                if pair.independent {
                    "independent"
                } else {
                    "CORRELATED"
                }
            );
        }
    }

    if let Some(spectral) = &report.spectral {
        println!("\nSpectrum");
        println!("{}", "-".repeat(64));
        println!("  flatness {:.4}", spectral.flatness);
        match &spectral.dominant {
            Some(peak) => println!(
                "  dominant f={:.4} (period {:.1} blocks, {:.1}x mean power)",
                peak.frequency, peak.period, peak.relative_power
            ),
            None => println!("  no peak above the noise floor"),
        }
    }
    if let Some(fit) = &report.damped_fit {
        println!(
            "  damped oscillation: period {:.1}, decay {:.3}, R²={:.2}",
            fit.period, fit.decay_rate, fit.r_squared
        );
    }
}
