//! Polls the backend until the user's out-of-band message has been seen.
//!
//! There is no push channel: the loop asks on a fixed interval, and once more whenever the
//! page becomes visible again (the user most likely just came back from the chat app).
//! Duplicate polls from the two triggers are harmless reads; the hand-off itself happens at
//! most once because the loop ends right after it.

use std::{sync::Arc, time::Duration};

use chathandoff_core::{Clock, VerificationResult, VerificationSession, Visibility};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendError, VerificationBackend},
    visibility::VisibilityListener,
};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SLOW_HINT_AFTER: u32 = 3;
pub const DEFAULT_GIVE_UP_AFTER_MS: u64 = 10 * 60 * 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollerSettings {
    pub interval_ms: u64,
    /// Failed attempts after which the UI may say "taking longer than expected".
    pub slow_hint_after: u32,
    /// `None` polls for as long as the subscription lives.
    pub give_up_after_ms: Option<u64>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            slow_hint_after: DEFAULT_SLOW_HINT_AFTER,
            give_up_after_ms: Some(DEFAULT_GIVE_UP_AFTER_MS),
        }
    }
}

/// Receives the session once verification lands. Owns everything that happens after.
pub trait SessionSink: Send + Sync {
    fn accept(&self, session_token: String, profile: Option<serde_json::Value>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Polling,
    Verified,
    /// The backend no longer knows the code; a fresh one is needed.
    Expired,
    GaveUp,
}

impl PollPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PollPhase::Polling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollStatus {
    pub phase: PollPhase,
    pub attempts_made: u32,
    pub slow_hint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollTrigger {
    Interval,
    BecameVisible,
}

/// A running poll loop. Dropping it stops the interval and removes the visibility listener.
#[derive(Debug)]
pub struct PollSubscription {
    code: String,
    task: JoinHandle<()>,
    status: watch::Receiver<PollStatus>,
}

impl PollSubscription {
    pub fn start(
        code: impl Into<String>,
        backend: Arc<dyn VerificationBackend>,
        sink: Arc<dyn SessionSink>,
        visibility: VisibilityListener,
        settings: PollerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = VerificationSession::new(code, clock.now_ms());
        let code = session.code.clone();
        let (status_tx, status_rx) = watch::channel(PollStatus {
            phase: PollPhase::Polling,
            attempts_made: 0,
            slow_hint: false,
        });

        info!(code = %code, interval_ms = settings.interval_ms, "verification polling started");
        let task = tokio::spawn(run_poller(
            session,
            backend,
            sink,
            visibility,
            settings,
            status_tx,
        ));

        Self {
            code,
            task,
            status: status_rx,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn status(&self) -> PollStatus {
        *self.status.borrow()
    }

    /// A receiver for UIs that redraw on every change.
    pub fn watch_status(&self) -> watch::Receiver<PollStatus> {
        self.status.clone()
    }

    /// Resolves once the loop reached a terminal phase. A loop that was torn down from
    /// outside reports `GaveUp`.
    pub async fn wait_terminal(&mut self) -> PollPhase {
        if let Ok(status) = self.status.wait_for(|s| s.phase.is_terminal()).await {
            return status.phase;
        }
        let phase = self.status.borrow().phase;
        if phase.is_terminal() {
            phase
        } else {
            PollPhase::GaveUp
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(self) {
        info!(code = %self.code, "verification polling cancelled");
        // Drop aborts the task.
    }
}

impl Drop for PollSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum PollOutcome {
    Pending,
    Verified {
        session_token: String,
        profile: Option<serde_json::Value>,
    },
    Expired,
    Failed(BackendError),
}

async fn poll_once(backend: &dyn VerificationBackend, code: &str) -> PollOutcome {
    match backend.status(code).await {
        Ok(VerificationResult {
            verified: true,
            session_token: Some(session_token),
            profile,
        }) => PollOutcome::Verified {
            session_token,
            profile,
        },
        Ok(VerificationResult { verified: true, .. }) => PollOutcome::Failed(
            BackendError::Decode("verified response without a session token".to_owned()),
        ),
        Ok(_) => PollOutcome::Pending,
        Err(err) if err.is_transient() => PollOutcome::Failed(err),
        Err(_) => PollOutcome::Expired,
    }
}

async fn run_poller(
    mut session: VerificationSession,
    backend: Arc<dyn VerificationBackend>,
    sink: Arc<dyn SessionSink>,
    mut visibility: VisibilityListener,
    settings: PollerSettings,
    status_tx: watch::Sender<PollStatus>,
) {
    let period = Duration::from_millis(settings.interval_ms.max(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let give_up = async move {
        match settings.give_up_after_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(give_up);

    let publish = |phase: PollPhase, attempts_made: u32| {
        status_tx.send_replace(PollStatus {
            phase,
            attempts_made,
            slow_hint: attempts_made >= settings.slow_hint_after,
        });
    };

    let mut listening = true;
    loop {
        let trigger = tokio::select! {
            _ = ticker.tick() => PollTrigger::Interval,
            changed = visibility.changed(), if listening => {
                match changed {
                    Some(Visibility::Visible) => PollTrigger::BecameVisible,
                    Some(Visibility::Hidden) => continue,
                    None => {
                        listening = false;
                        continue;
                    }
                }
            }
            _ = &mut give_up => {
                info!(
                    code = %session.code,
                    attempts = session.attempts_made,
                    "verification polling gave up"
                );
                publish(PollPhase::GaveUp, session.attempts_made);
                return;
            }
        };

        debug!(code = %session.code, ?trigger, "polling verification status");
        match poll_once(backend.as_ref(), &session.code).await {
            PollOutcome::Pending => {}
            PollOutcome::Verified {
                session_token,
                profile,
            } => {
                info!(code = %session.code, ?trigger, "verification confirmed");
                sink.accept(session_token, profile);
                publish(PollPhase::Verified, session.attempts_made);
                return;
            }
            PollOutcome::Expired => {
                warn!(code = %session.code, "verification code rejected by backend");
                publish(PollPhase::Expired, session.attempts_made);
                return;
            }
            PollOutcome::Failed(err) => {
                let attempts = session.record_failed_attempt();
                warn!(code = %session.code, attempt = attempts, "verification poll failed: {err}");
                publish(PollPhase::Polling, attempts);
            }
        }
    }
}
