use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use vigil_core::events::{RateLimitInfo, RateLimitProvider, RateLimitScope};
use vigil_core::types::{ProcessKind, TaskKey};

use crate::pattern::compiled;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDetection {
    pub provider: RateLimitProvider,
    pub scope: Option<RateLimitScope>,
    pub resets_at: Option<String>,
    pub matched_line: String,
}

impl RateLimitDetection {
    pub fn into_info(self, key: TaskKey, process_kind: ProcessKind) -> RateLimitInfo {
        RateLimitInfo {
            key,
            process_kind,
            provider: self.provider,
            scope: self.scope,
            resets_at: self.resets_at,
            matched_line: self.matched_line,
            detected_at: Utc::now(),
        }
    }
}

static LIMIT_REACHED: OnceLock<Option<Regex>> = OnceLock::new();
static GENERIC: OnceLock<Option<Regex>> = OnceLock::new();

const WEEKDAYS_AND_MONTHS: &[&str] = &[
    "mon", "tue", "wed", "thu", "fri", "sat", "sun", "jan", "feb", "mar", "apr", "may", "jun",
    "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Scan recent output for a usage-limit signature. The most recent matching
/// line wins. `fallback` is used when the text does not name a provider.
pub fn detect_rate_limit(text: &str, fallback: RateLimitProvider) -> Option<RateLimitDetection> {
    let limit_reached = compiled(
        &LIMIT_REACHED,
        r"(?i)limit reached\s*[·•|\-]?\s*resets\s+(.+?)\s*$",
    );
    let generic = compiled(
        &GENERIC,
        r"(?i)rate[ _-]?limit|usage limit|too many requests|quota exceeded|(?:status|error|http)[: ]+429\b|weekly limit|5-hour limit",
    );

    for line in text.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(caps) = limit_reached.and_then(|re| re.captures(trimmed)) {
            let resets_at = caps.get(1).map(|when| when.as_str().to_string());
            return Some(RateLimitDetection {
                provider: provider_for(trimmed, RateLimitProvider::Claude),
                scope: scope_for(trimmed, resets_at.as_deref()),
                resets_at,
                matched_line: trimmed.to_string(),
            });
        }

        if generic.is_some_and(|re| re.is_match(trimmed)) {
            return Some(RateLimitDetection {
                provider: provider_for(trimmed, fallback),
                scope: scope_for(trimmed, None),
                resets_at: None,
                matched_line: trimmed.to_string(),
            });
        }
    }

    None
}

fn provider_for(line: &str, fallback: RateLimitProvider) -> RateLimitProvider {
    let lower = line.to_lowercase();
    if lower.contains("codex") || lower.contains("openai") {
        RateLimitProvider::Codex
    } else if lower.contains("claude") || lower.contains("anthropic") {
        RateLimitProvider::Claude
    } else {
        fallback
    }
}

/// Weekly limits reset on a named day or date; session (5-hour) limits reset
/// at a time of day.
fn scope_for(line: &str, resets_at: Option<&str>) -> Option<RateLimitScope> {
    let lower = line.to_lowercase();
    if lower.contains("weekly") || lower.contains("week limit") {
        return Some(RateLimitScope::Weekly);
    }
    if lower.contains("5-hour") || lower.contains("five hour") || lower.contains("session limit") {
        return Some(RateLimitScope::Session);
    }

    let resets = resets_at?.to_lowercase();
    let names_a_day = resets
        .split(|c: char| !c.is_ascii_alphabetic())
        .any(|word| word.len() >= 3 && WEEKDAYS_AND_MONTHS.iter().any(|name| word.starts_with(name)));
    if names_a_day {
        Some(RateLimitScope::Weekly)
    } else {
        Some(RateLimitScope::Session)
    }
}
