pub mod analyze;
pub mod run;
pub mod sessions;

use std::collections::HashMap;

use serde::Serialize;

/// Parse `key:value` tags. Malformed entries are reported and skipped.
pub fn parse_tags(tags: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for tag in tags {
        match tag.split_once(':') {
            Some((k, v)) if !k.trim().is_empty() => {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
            _ => eprintln!("Warning: ignoring malformed tag '{tag}' (expected key:value)"),
        }
    }
    map
}

/// Pretty-print `value` as JSON to `path`.
pub fn write_json<T: Serialize>(value: &T, path: &str, label: &str) {
    let json = match serde_json::to_string_pretty(value) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("\nFailed to serialize {label}: {e}");
            return;
        }
    };
    match std::fs::write(path, json) {
        Ok(()) => println!("\n{label} written to {path}"),
        Err(e) => eprintln!("\nFailed to write {path}: {e}"),
    }
}

pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else if ms < 3_600_000 {
        format!("{:.1}m", ms as f64 / 60_000.0)
    } else {
        format!("{:.1}h", ms as f64 / 3_600_000.0)
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// `52.0% z=+0.49 p=0.624`
pub fn format_score(hit_rate: f64, z: f64, p: f64) -> String {
    format!("{:>5.1}% z={z:+.2} p={p:.3}", hit_rate * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // parse_tags tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags(&["operator:ana".into(), "room: b2 ".into()]);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["operator"], "ana");
        assert_eq!(tags["room"], "b2");
    }

    #[test]
    fn test_parse_tags_skips_malformed() {
        let tags = parse_tags(&["nocolon".into(), ":empty".into(), "k:v:w".into()]);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags["k"], "v:w");
    }

    // -----------------------------------------------------------------------
    // formatting tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_format_duration_ms() {
        assert_eq!(format_duration_ms(250), "250ms");
        assert_eq!(format_duration_ms(1_500), "1.5s");
        assert_eq!(format_duration_ms(90_000), "1.5m");
        assert_eq!(format_duration_ms(5_400_000), "1.5h");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("2026-10-18T101500Z-abcdef12", 12), "2026-10-1...");
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(0.52, 0.49, 0.624), " 52.0% z=+0.49 p=0.624");
    }
}
