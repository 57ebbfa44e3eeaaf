//! Did the external app actually take the foreground?
//!
//! The only evidence is the page's own visibility. Three timelines matter:
//!
//! - the page never goes hidden before `t_max`: nothing handled the link;
//! - the page goes hidden and comes back before `t_bounce`: an app-store or scheme
//!   resolution page flashed past, not a real hand-off;
//! - the page stays hidden for at least `t_bounce`: the app opened.
//!
//! [`OpenVerifier`] is a plain state machine over millisecond timestamps. It owns no timers;
//! the caller feeds it visibility changes and clock ticks and asks for the next deadline.

use serde::{Deserialize, Serialize};

use crate::CoreError;

pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 4_000;
pub const DEFAULT_BOUNCE_THRESHOLD_MS: u64 = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifierTimings {
    /// `T_max`: how long the page may stay in front before the launch counts as ignored.
    pub open_timeout_ms: u64,
    /// `T_bounce`: minimum time hidden for the hand-off to count as genuine.
    pub bounce_threshold_ms: u64,
}

impl Default for VerifierTimings {
    fn default() -> Self {
        Self {
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
            bounce_threshold_ms: DEFAULT_BOUNCE_THRESHOLD_MS,
        }
    }
}

impl VerifierTimings {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.bounce_threshold_ms == 0 || self.bounce_threshold_ms >= self.open_timeout_ms {
            return Err(CoreError::InvalidTimings {
                bounce_ms: self.bounce_threshold_ms,
                max_ms: self.open_timeout_ms,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NeverHidden,
    Bounced { hidden_for_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenVerdict {
    Succeeded,
    Failed(FailureKind),
}

impl OpenVerdict {
    pub fn is_success(self) -> bool {
        matches!(self, OpenVerdict::Succeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierState {
    Watching,
    HiddenPending { hidden_at_ms: u64 },
    Concluded(OpenVerdict),
}

#[derive(Debug, Clone)]
pub struct OpenVerifier {
    timings: VerifierTimings,
    started_at_ms: u64,
    state: VerifierState,
}

impl OpenVerifier {
    pub fn new(timings: VerifierTimings, started_at_ms: u64) -> Self {
        Self {
            timings,
            started_at_ms,
            state: VerifierState::Watching,
        }
    }

    pub fn state(&self) -> VerifierState {
        self.state
    }

    pub fn verdict(&self) -> Option<OpenVerdict> {
        match self.state {
            VerifierState::Concluded(verdict) => Some(verdict),
            _ => None,
        }
    }

    /// When the current state resolves on its own if nothing else happens.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        match self.state {
            VerifierState::Watching => {
                Some(self.started_at_ms.saturating_add(self.timings.open_timeout_ms))
            }
            VerifierState::HiddenPending { hidden_at_ms } => {
                Some(hidden_at_ms.saturating_add(self.timings.bounce_threshold_ms))
            }
            VerifierState::Concluded(_) => None,
        }
    }

    pub fn on_tick(&mut self, now_ms: u64) -> Option<OpenVerdict> {
        if let Some(deadline) = self.next_deadline_ms()
            && now_ms >= deadline
        {
            let verdict = match self.state {
                VerifierState::Watching => OpenVerdict::Failed(FailureKind::NeverHidden),
                _ => OpenVerdict::Succeeded,
            };
            self.state = VerifierState::Concluded(verdict);
        }
        self.verdict()
    }

    /// Apply a visibility observation. Deadlines that passed before `now_ms` win over the
    /// event, so an event landing exactly on a deadline sees that deadline's verdict.
    pub fn on_visibility(&mut self, visibility: Visibility, now_ms: u64) -> Option<OpenVerdict> {
        if let Some(verdict) = self.on_tick(now_ms) {
            return Some(verdict);
        }

        match (self.state, visibility) {
            (VerifierState::Watching, Visibility::Hidden) => {
                self.state = VerifierState::HiddenPending {
                    hidden_at_ms: now_ms,
                };
            }
            (VerifierState::HiddenPending { hidden_at_ms }, Visibility::Visible) => {
                self.state = VerifierState::Concluded(OpenVerdict::Failed(FailureKind::Bounced {
                    hidden_for_ms: now_ms.saturating_sub(hidden_at_ms),
                }));
            }
            _ => {}
        }
        self.verdict()
    }
}

/// Run a whole timeline through a fresh verifier started at 0. `events` are
/// `(offset_ms, visibility)` pairs in order; the verifier is ticked at `until_ms` last.
pub fn classify(
    timings: VerifierTimings,
    events: &[(u64, Visibility)],
    until_ms: u64,
) -> Option<OpenVerdict> {
    let mut verifier = OpenVerifier::new(timings, 0);
    for &(at_ms, visibility) in events {
        if let Some(verdict) = verifier.on_visibility(visibility, at_ms) {
            return Some(verdict);
        }
    }
    verifier.on_tick(until_ms)
}
