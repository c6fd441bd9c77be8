//! Filenames for delivered artifacts.
//!
//! Internal files use `{jobId}_{role}{ext}` (see [`crate::cleanup::JobPaths`]);
//! the helpers here only shape the *suggested* name handed to the transport,
//! which is derived from whatever name the user's source carried.

use std::path::Path;

/// Characters rejected by at least one of Windows, Linux or macOS.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows device names (case-insensitive, with or without extension).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest stem kept in a suggested filename, in characters.
pub const MAX_STEM_CHARS: usize = 120;

/// Sanitize a name so every platform accepts it as a filename.
///
/// Runs of invalid or control characters collapse into a single `_`,
/// surrounding spaces and dots are trimmed, reserved device names get a `_`
/// prefix and an empty result becomes `video`.
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let bad = c.is_control() || INVALID_CHARS.contains(&c);
        match (bad, out.ends_with('_')) {
            (true, true) => {}
            (true, false) => out.push('_'),
            (false, _) => out.push(c),
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "video".to_string();
    }

    let upper = trimmed.to_uppercase();
    let device = upper.split('.').next().unwrap_or_default();
    if RESERVED_NAMES.contains(&device) {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}

/// Stem of a user-supplied name or URL path segment, sanitized and shortened.
pub fn display_stem(original: &str) -> String {
    let last = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original)
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let stem = Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(last);
    let clean = sanitize_filename(stem);
    clean.chars().take(MAX_STEM_CHARS).collect()
}

/// Build the suggested artifact name: `{stem}_{suffix}.{ext}`.
///
/// An empty suffix yields `{stem}.{ext}`; `ext` may be given with or without
/// its leading dot.
pub fn output_filename(original: &str, suffix: &str, ext: &str) -> String {
    let stem = display_stem(original);
    let ext = ext.trim_start_matches('.');
    match (suffix.is_empty(), ext.is_empty()) {
        (true, true) => stem,
        (true, false) => format!("{stem}.{ext}"),
        (false, true) => format!("{stem}_{suffix}"),
        (false, false) => format!("{stem}_{suffix}.{ext}"),
    }
}

/// Lower-cased extension including the dot (`.mkv`), or empty.
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_collapses_invalid_runs() {
        assert_eq!(sanitize_filename("a<>:\"b"), "a_b");
        assert_eq!(sanitize_filename("clip\x00\x01name"), "clip_name");
        assert_eq!(sanitize_filename("what?"), "what_");
    }

    #[test]
    fn test_sanitize_empty_and_dots() {
        assert_eq!(sanitize_filename(""), "video");
        assert_eq!(sanitize_filename(" ... "), "video");
        assert_eq!(sanitize_filename("..movie.."), "movie");
    }

    #[test]
    fn test_sanitize_reserved() {
        assert_eq!(sanitize_filename("nul"), "_nul");
        assert_eq!(sanitize_filename("COM3.mkv"), "_COM3.mkv");
        assert_eq!(sanitize_filename("console"), "console");
    }

    #[test]
    fn test_sanitize_keeps_unicode() {
        assert_eq!(sanitize_filename("字幕テスト 자막"), "字幕テスト 자막");
    }

    #[test]
    fn test_output_filename_variants() {
        assert_eq!(
            output_filename("Holiday Trip.mkv", "720p", "mp4"),
            "Holiday Trip_720p.mp4"
        );
        assert_eq!(
            output_filename("https://cdn.example.com/a/b/movie.webm?token=1", "compressed", ".mp4"),
            "movie_compressed.mp4"
        );
        assert_eq!(output_filename("talk.mp4", "", "mp3"), "talk.mp3");
        assert_eq!(output_filename("", "subtitled", "mp4"), "video_subtitled.mp4");
    }

    #[test]
    fn test_output_filename_truncates_long_stems() {
        let long = format!("{}.mp4", "x".repeat(500));
        let name = output_filename(&long, "720p", "mp4");
        assert_eq!(name.len(), MAX_STEM_CHARS + "_720p.mp4".len());
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("Movie.MKV"), ".mkv");
        assert_eq!(extension_of("noext"), "");
    }
}
