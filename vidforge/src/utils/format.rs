//! Human-readable rendering of sizes, durations and progress.

use std::time::Duration;

const SIZE_UNITS: &[&str] = &["B", "KB", "MB", "GB"];

/// Width of the text progress bar in cells.
pub const PROGRESS_BAR_WIDTH: usize = 20;

/// Format a byte count with one decimal (`1.5 MB`).
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in SIZE_UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

/// Format a transfer rate (`2.3 MB/s`).
pub fn format_rate(bytes_per_sec: f64) -> String {
    if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
        return "-".to_string();
    }
    format!("{}/s", format_size(bytes_per_sec as u64))
}

/// Format elapsed time as `Ns`, `Mm Ss` or `Hh Mm`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Format an ETA in seconds; unknown or non-positive values render as `-`.
pub fn format_eta(secs: f64) -> String {
    if !secs.is_finite() || secs <= 0.0 {
        return "-".to_string();
    }
    format_elapsed(Duration::from_secs(secs.round() as u64))
}

/// Render a fixed-width bar such as `[██████░░░░░░░░░░░░░░]`.
pub fn progress_bar(percent: u8) -> String {
    let filled = (usize::from(percent.min(100)) * PROGRESS_BAR_WIDTH) / 100;
    format!(
        "[{}{}]",
        "█".repeat(filled),
        "░".repeat(PROGRESS_BAR_WIDTH - filled)
    )
}

/// Truncate to at most `max` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Keep only the trailing `max` characters (used for diagnostic tails).
pub fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.0 B");
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.0 MB");
        assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2.0 GB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 * 1024), "3.0 TB");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_elapsed(Duration::from_secs(7260)), "2h 1m");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0.0), "-");
        assert_eq!(format_eta(f64::NAN), "-");
        assert_eq!(format_eta(90.4), "1m 30s");
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0).chars().filter(|c| *c == '█').count(), 0);
        assert_eq!(progress_bar(50).chars().filter(|c| *c == '█').count(), 10);
        assert_eq!(progress_bar(100).chars().filter(|c| *c == '░').count(), 0);
    }

    #[test]
    fn test_truncate_and_tail() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefghij", 6), "abc...");
        assert_eq!(tail_chars("abcdefghij", 3), "hij");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
