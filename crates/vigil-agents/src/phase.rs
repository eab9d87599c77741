//! Coarse phase classification of agent output.
//!
//! [`infer_phase`] is pure: it sees one chunk of text plus the phase the task
//! is currently in and either names the phase the chunk puts the task in or
//! returns `None`. Rules are checked in priority order and the first match
//! wins.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use vigil_core::types::Phase;

use crate::pattern::compiled;
use crate::progress::fraction_percent;

/// Transition produced by a chunk of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub phase: Phase,
    pub message: String,
    pub current_subtask: Option<String>,
    /// Percent within `phase`, when the chunk states one.
    pub sub_progress: Option<u8>,
}

impl PhaseUpdate {
    fn new(phase: Phase, message: &str) -> Self {
        Self {
            phase,
            message: message.to_string(),
            current_subtask: None,
            sub_progress: None,
        }
    }
}

const COMPLETE_SENTINELS: &[&str] = &["=== build complete ===", "qa passed"];

/// Failure is terminal, so only the backend's explicit sentinels count.
/// Prose like "previous build failed, retrying" is not one.
const FAILED_SENTINELS: &[&str] = &[
    "=== build failed ===",
    "qa failed permanently",
    "max qa iterations reached",
];

const INCOMPLETE_MARKERS: &[&str] = &["build incomplete", "subtasks still pending"];

const QA_FIXER_MARKERS: &[&str] = &["qa fixer", "qa_fixer", "fixing qa issues", "applying qa fixes"];

const QA_REVIEWER_MARKERS: &[&str] = &[
    "qa reviewer",
    "qa_reviewer",
    "starting qa",
    "running qa validation",
    "qa review",
];

const CODER_MARKERS: &[&str] = &[
    "coder agent",
    "coder session",
    "starting coder",
    "implementing subtask",
    "working on subtask",
    "next subtask",
];

const PLANNER_MARKERS: &[&str] = &[
    "planner agent",
    "planner session",
    "creating implementation plan",
    "planning phase",
];

/// Spec-runner vocabulary, in pipeline order. Every stage is still planning
/// from the task's point of view.
const SPEC_RUNNER_STAGES: &[(&str, &str)] = &[
    ("spec creation complete", "Specification created"),
    ("validating spec", "Validating specification..."),
    ("self-critique", "Reviewing specification..."),
    ("writing spec", "Writing specification..."),
    ("spec writer", "Writing specification..."),
    ("research", "Researching..."),
    ("complexity assessment", "Assessing complexity..."),
    ("assessing complexity", "Assessing complexity..."),
    ("gathering requirements", "Gathering requirements..."),
    ("requirements", "Gathering requirements..."),
    ("discovery", "Discovering project context..."),
    ("discovering", "Discovering project context..."),
];

static SUBTASK_FRACTION: OnceLock<Option<Regex>> = OnceLock::new();
static SUBTASK_LABEL: OnceLock<Option<Regex>> = OnceLock::new();

/// Classify `chunk` given the task's current phase.
///
/// Only an explicit completion sentinel moves a task to `complete`; lines
/// such as "all subtasks completed" keep it in `coding`. Once a task is
/// terminal, nothing but a completion sentinel changes it again.
pub fn infer_phase(chunk: &str, current: Phase, spec_runner: bool) -> Option<PhaseUpdate> {
    let lower = chunk.to_lowercase();

    if contains_any(&lower, COMPLETE_SENTINELS) {
        return Some(PhaseUpdate {
            sub_progress: Some(100),
            ..PhaseUpdate::new(Phase::Complete, "Build complete")
        });
    }
    if current.is_terminal() {
        return None;
    }
    if contains_any(&lower, FAILED_SENTINELS) {
        return Some(PhaseUpdate::new(Phase::Failed, "Build failed"));
    }

    if spec_runner {
        return SPEC_RUNNER_STAGES
            .iter()
            .find(|(marker, _)| lower.contains(marker))
            .map(|(_, message)| PhaseUpdate::new(Phase::Planning, message));
    }

    if contains_any(&lower, INCOMPLETE_MARKERS) {
        return Some(PhaseUpdate::new(
            Phase::Coding,
            "Build incomplete: subtasks still pending",
        ));
    }
    if lower.contains("all subtasks completed") {
        return Some(PhaseUpdate::new(
            Phase::Coding,
            "All subtasks completed, waiting for QA",
        ));
    }
    if contains_any(&lower, QA_FIXER_MARKERS) {
        return Some(PhaseUpdate::new(Phase::QaFixing, "Fixing QA issues..."));
    }
    if contains_any(&lower, QA_REVIEWER_MARKERS) {
        return Some(PhaseUpdate::new(Phase::QaReview, "Running QA review..."));
    }

    let fraction = subtask_fraction(&lower);
    if fraction.is_some() || contains_any(&lower, CODER_MARKERS) {
        let current_subtask = subtask_label(&lower);
        let message = match (&current_subtask, fraction) {
            (Some(label), _) => format!("Implementing {label}"),
            (None, Some((done, total))) => format!("Implementing subtask {done}/{total}"),
            (None, None) => "Implementing subtasks...".to_string(),
        };
        return Some(PhaseUpdate {
            phase: Phase::Coding,
            message,
            current_subtask,
            sub_progress: fraction.and_then(|(done, total)| fraction_percent(done, total)),
        });
    }

    if contains_any(&lower, PLANNER_MARKERS) {
        return Some(PhaseUpdate::new(
            Phase::Planning,
            "Creating implementation plan...",
        ));
    }

    None
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// `subtask 3/8` style counters. The count of finished subtasks is one less
/// than the subtask being started.
fn subtask_fraction(lower: &str) -> Option<(usize, usize)> {
    let re = compiled(&SUBTASK_FRACTION, r"subtask\s+(\d+)\s*/\s*(\d+)")?;
    let caps = re.captures(lower)?;
    let current: usize = caps.get(1)?.as_str().parse().ok()?;
    let total: usize = caps.get(2)?.as_str().parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((current.saturating_sub(1).min(total), total))
}

fn subtask_label(lower: &str) -> Option<String> {
    let re = compiled(&SUBTASK_LABEL, r"\b(subtask-[0-9a-z][0-9a-z_.-]*)")?;
    re.captures(lower)
        .and_then(|caps| caps.get(1))
        .map(|label| label.as_str().trim_end_matches(['.', '-']).to_string())
}
