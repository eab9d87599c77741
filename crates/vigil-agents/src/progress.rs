//! Fixed phase-weight ranges that turn a sub-phase percentage into overall
//! task progress.

use vigil_core::types::{Phase, PhaseState};

use crate::phase::PhaseUpdate;

/// Inclusive `(start, end)` overall-percent range owned by a phase.
pub fn phase_range(phase: Phase) -> (u8, u8) {
    match phase {
        Phase::Idle | Phase::Failed => (0, 0),
        Phase::Planning => (0, 20),
        Phase::Coding => (20, 80),
        Phase::QaReview | Phase::QaFixing => (80, 95),
        Phase::Complete => (100, 100),
    }
}

/// Map a phase-relative percentage (clamped to 0..=100) onto the overall scale.
pub fn overall_progress(phase: Phase, sub_progress: u8) -> u8 {
    let (start, end) = phase_range(phase);
    let sub = u32::from(sub_progress.min(100));
    let span = u32::from(end - start);
    start + (span * sub / 100) as u8
}

/// Percentage of `done` out of `total`, or `None` when nothing is countable.
pub fn fraction_percent(done: usize, total: usize) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let done = done.min(total);
    Some((done * 100 / total) as u8)
}

/// Fold an inference result into the previous state.
///
/// Entering a new phase resets progress to the phase's start unless the
/// update carries its own sub-progress; staying in a phase keeps the
/// previous percent and subtask label when the update has none.
pub fn apply_update(previous: &PhaseState, update: &PhaseUpdate) -> PhaseState {
    let same_phase = previous.phase == update.phase;
    let progress_percent = match update.sub_progress {
        Some(sub) => overall_progress(update.phase, sub),
        None if same_phase => previous.progress_percent,
        None => phase_range(update.phase).0,
    };
    let current_subtask = match (&update.current_subtask, same_phase) {
        (Some(label), _) => Some(label.clone()),
        (None, true) => previous.current_subtask.clone(),
        (None, false) => None,
    };

    PhaseState {
        phase: update.phase,
        progress_percent,
        current_subtask,
        message: update.message.clone(),
    }
}

/// Whether publishing `next` after `previous` tells subscribers anything new.
pub fn is_visible_change(previous: &PhaseState, next: &PhaseState) -> bool {
    previous.phase != next.phase
        || previous.progress_percent != next.progress_percent
        || previous.current_subtask != next.current_subtask
}
