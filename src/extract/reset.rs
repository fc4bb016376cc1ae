//! Reset-time phrases that follow each quota section on the usage page.

use crate::models::UNKNOWN_RESET;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Bumped whenever `RESET_PATTERNS` changes order or content.
pub const RESET_PATTERNS_VERSION: u32 = 1;

/// Characters scanned after a section label when looking for its reset phrase.
pub const DEFAULT_RESET_WINDOW: usize = 400;

pub struct ResetPattern {
    pub name: &'static str,
    pub regex: Regex,
}

fn pattern(name: &'static str, raw: &str) -> ResetPattern {
    ResetPattern {
        name,
        regex: Regex::new(raw).expect("reset pattern must compile"),
    }
}

/// Ordered from most to least specific; the first capture wins.
pub static RESET_PATTERNS: Lazy<Vec<ResetPattern>> = Lazy::new(|| {
    vec![
        pattern("hours_minutes", r"(\d+時間\d+分後)にリセット"),
        pattern("hours", r"(\d+時間後)にリセット"),
        pattern("minutes", r"(\d+分後)にリセット"),
        pattern("clock_weekday", r"(\d+:\d+\s*\([^)]+\))\s*にリセット"),
        pattern("english", r"(?i)Resets?\s+in\s+([0-9A-Za-z_ \t]+)"),
    ]
});

pub fn parse_reset(section_label: &str, full_text: &str) -> String {
    parse_reset_within(section_label, full_text, DEFAULT_RESET_WINDOW)
}

pub fn parse_reset_within(section_label: &str, full_text: &str, window_chars: usize) -> String {
    let Some(window) = section_window(section_label, full_text, window_chars) else {
        return UNKNOWN_RESET.to_string();
    };

    for p in RESET_PATTERNS.iter() {
        if let Some(caps) = p.regex.captures(window) {
            let label = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            if !label.is_empty() {
                tracing::trace!(pattern = p.name, label, "matched reset phrase");
                return label.to_string();
            }
        }
    }

    UNKNOWN_RESET.to_string()
}

/// Text starting at the first case-insensitive occurrence of `label`, at most
/// `window_chars` characters long.
fn section_window<'a>(label: &str, text: &'a str, window_chars: usize) -> Option<&'a str> {
    let finder = RegexBuilder::new(&regex::escape(label))
        .case_insensitive(true)
        .build()
        .ok()?;
    let start = finder.find(text)?.start();
    let rest = &text[start..];
    let end = rest
        .char_indices()
        .nth(window_chars)
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_label_returns_sentinel() {
        assert_eq!(parse_reset("Opus only", "Current session 3時間後にリセット"), "--");
    }

    #[test]
    fn hours_and_minutes_take_priority() {
        let text = "Current session 12% 使用済み 2時間30分後にリセット";
        assert_eq!(parse_reset("Current session", text), "2時間30分後");
    }

    #[test]
    fn hours_only_and_minutes_only() {
        assert_eq!(parse_reset("All models", "All models 5% 4時間後にリセット"), "4時間後");
        assert_eq!(parse_reset("All models", "All models 5% 45分後にリセット"), "45分後");
    }

    #[test]
    fn clock_with_weekday_allows_space_before_marker() {
        assert_eq!(
            parse_reset("All models", "All models 20% 12:59 (木)にリセット"),
            "12:59 (木)"
        );
        assert_eq!(
            parse_reset("All models", "All models 20% 9:05 (Thu) にリセット"),
            "9:05 (Thu)"
        );
    }

    #[test]
    fn english_fallback_stops_at_line_end() {
        let text = "Current session\n30% used\nResets in 2 hr 14 min\nAll models";
        assert_eq!(parse_reset("current SESSION", text), "2 hr 14 min");
    }

    #[test]
    fn phrase_outside_window_is_ignored() {
        let filler = "x".repeat(DEFAULT_RESET_WINDOW);
        let text = format!("Opus only 1% {filler} 3時間後にリセット");
        assert_eq!(parse_reset("Opus only", &text), "--");
    }

    #[test]
    fn window_counts_characters_not_bytes() {
        let filler = "あ".repeat(20);
        let text = format!("Opus only {filler}1時間後にリセット");
        assert_eq!(parse_reset_within("Opus only", &text, 50), "1時間後");
    }

    #[test]
    fn label_without_phrase_returns_sentinel() {
        assert_eq!(parse_reset("All models", "All models 10% 使用済み"), "--");
    }
}
