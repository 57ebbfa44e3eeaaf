use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chathandoff_core::{
    Clock, LaunchAttempt, OpenVerdict, OpenVerifier, PreferenceStore, VerifierTimings,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::visibility::VisibilityListener;

/// Orders preference writes across successive launches. A watch may only clear the
/// preference while its own launch is still the latest one, so a stale watch that
/// concludes late never erases a newer pick.
#[derive(Debug, Clone, Default)]
pub struct LaunchEpoch {
    latest: Arc<Mutex<u64>>,
}

impl LaunchEpoch {
    /// Run `record` and start a new launch as one step. Returns the new launch's number.
    pub fn advance(&self, record: impl FnOnce()) -> u64 {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        record();
        *latest += 1;
        *latest
    }

    /// Run `f` only while `launch` is the latest launch. Returns whether it ran.
    pub fn if_latest(&self, launch: u64, f: impl FnOnce()) -> bool {
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if *latest != launch {
            return false;
        }
        f();
        true
    }
}

/// The running open-verifier for one launch. Dropping it stops the timers and the
/// visibility listener.
#[derive(Debug)]
pub struct OpenWatch {
    task: JoinHandle<()>,
    verdict: watch::Receiver<Option<OpenVerdict>>,
}

impl OpenWatch {
    /// Start watching. `visibility` must be subscribed before the deep link is fired.
    pub fn spawn(
        attempt: &LaunchAttempt,
        timings: VerifierTimings,
        visibility: VisibilityListener,
        clock: Arc<dyn Clock>,
        prefs: PreferenceStore,
        epoch: LaunchEpoch,
        launch: u64,
    ) -> Self {
        let verifier = OpenVerifier::new(timings, attempt.launched_at_ms);
        let (verdict_tx, verdict_rx) = watch::channel(None);
        let variant = attempt.variant;
        let task = tokio::spawn(async move {
            let verdict = run_open_watch(verifier, visibility, clock).await;
            match verdict {
                OpenVerdict::Succeeded => {
                    info!(variant = ?variant, "external app took the foreground");
                }
                OpenVerdict::Failed(kind) => {
                    info!(variant = ?variant, failure = ?kind, "external app did not open");
                    let current = epoch.if_latest(launch, || {
                        if let Err(err) = prefs.clear() {
                            warn!("failed to clear app preference after failed launch: {err}");
                        }
                    });
                    if !current {
                        debug!(launch, "newer launch owns the app preference; left as is");
                    }
                }
            }
            let _ = verdict_tx.send(Some(verdict));
        });

        Self {
            task,
            verdict: verdict_rx,
        }
    }

    pub fn current(&self) -> Option<OpenVerdict> {
        *self.verdict.borrow()
    }

    /// Wait for the verdict. `None` if the watch was torn down before reaching one.
    pub async fn verdict(&mut self) -> Option<OpenVerdict> {
        if let Ok(verdict) = self.verdict.wait_for(Option::is_some).await {
            return *verdict;
        }
        *self.verdict.borrow()
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for OpenWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_open_watch(
    mut verifier: OpenVerifier,
    mut visibility: VisibilityListener,
    clock: Arc<dyn Clock>,
) -> OpenVerdict {
    let mut outcome = verifier.on_visibility(visibility.current(), clock.now_ms());
    let mut listening = true;

    loop {
        if let Some(verdict) = outcome {
            return verdict;
        }
        let deadline = verifier
            .next_deadline_ms()
            .unwrap_or_else(|| clock.now_ms());
        let wait = Duration::from_millis(deadline.saturating_sub(clock.now_ms()));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                outcome = verifier.on_tick(clock.now_ms());
            }
            changed = visibility.changed(), if listening => match changed {
                Some(state) => {
                    debug!(visibility = ?state, "page visibility changed during launch");
                    outcome = verifier.on_visibility(state, clock.now_ms());
                }
                None => {
                    // The page is gone; only the deadlines are left to decide.
                    listening = false;
                }
            },
        }
    }
}
