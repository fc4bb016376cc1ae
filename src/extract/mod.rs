//! Turns the visible text of the usage page into a [`UsageSnapshot`].

pub mod reset;

use crate::error::ExtractError;
use crate::models::{UsageBucket, UsageSnapshot};
use once_cell::sync::Lazy;
use regex::Regex;
use reset::{parse_reset_within, DEFAULT_RESET_WINDOW, RESET_PATTERNS_VERSION};

/// Shorter page text means the page has not finished rendering.
pub const DEFAULT_MIN_TEXT_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKey {
    CurrentSession,
    AllModels,
    OpusOnly,
}

pub const SECTIONS: [(SectionKey, &str); 3] = [
    (SectionKey::CurrentSession, "Current session"),
    (SectionKey::AllModels, "All models"),
    (SectionKey::OpusOnly, "Opus only"),
];

struct SectionMatcher {
    key: SectionKey,
    label: &'static str,
    with_marker: Regex,
    percent_only: Regex,
}

static MATCHERS: Lazy<Vec<SectionMatcher>> = Lazy::new(|| {
    SECTIONS
        .iter()
        .map(|&(key, label)| {
            let words = label
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+");
            SectionMatcher {
                key,
                label,
                with_marker: Regex::new(&format!(r"(?is){words}.*?([0-9]+)%.*?(?:使用済み|used)"))
                    .expect("section pattern must compile"),
                percent_only: Regex::new(&format!(r"(?is){words}.*?([0-9]+)%"))
                    .expect("section pattern must compile"),
            }
        })
        .collect()
});

#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    min_text_len: usize,
    reset_window_chars: usize,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MIN_TEXT_LEN, DEFAULT_RESET_WINDOW)
    }
}

impl Extractor {
    pub fn with_limits(min_text_len: usize, reset_window_chars: usize) -> Self {
        Self {
            min_text_len,
            reset_window_chars,
        }
    }

    pub fn extract(&self, page_text: &str) -> Result<UsageSnapshot, ExtractError> {
        let len = page_text.chars().count();
        if len < self.min_text_len {
            tracing::warn!(len, "page text too short, page may not be fully loaded");
            return Err(ExtractError::PageNotReady { len });
        }

        let mut snapshot = UsageSnapshot::default();
        for matcher in MATCHERS.iter() {
            let bucket = self.match_section(matcher, page_text);
            match &bucket {
                Some(b) => tracing::debug!(section = matcher.label, percentage = b.percentage, reset = %b.reset_label, "section found"),
                None => tracing::debug!(section = matcher.label, "section not found"),
            }
            match matcher.key {
                SectionKey::CurrentSession => snapshot.current_session = bucket,
                SectionKey::AllModels => snapshot.all_models = bucket,
                SectionKey::OpusOnly => snapshot.opus_only = bucket,
            }
        }

        if snapshot.is_empty() {
            tracing::warn!(
                len,
                patterns_version = RESET_PATTERNS_VERSION,
                "no usage sections found in page text"
            );
            return Err(ExtractError::NotFound);
        }
        Ok(snapshot)
    }

    fn match_section(&self, matcher: &SectionMatcher, text: &str) -> Option<UsageBucket> {
        let caps = matcher
            .with_marker
            .captures(text)
            .or_else(|| matcher.percent_only.captures(text))?;
        let digits = caps.get(1)?.as_str();
        let percentage = match digits.parse::<u32>() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(section = matcher.label, digits, error = %e, "unparseable percentage");
                return None;
            }
        };

        Some(UsageBucket {
            percentage,
            reset_label: parse_reset_within(matcher.label, text, self.reset_window_chars),
        })
    }
}

/// Extracts with the default limits.
pub fn extract(page_text: &str) -> Result<UsageSnapshot, ExtractError> {
    Extractor::default().extract(page_text)
}
