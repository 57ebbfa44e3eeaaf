//! One verification hand-off from a screen's point of view.
//!
//! Two watchers start from the same user action and guard different things: the open
//! watch guards the remembered app variant, the poller guards the login. A failed open never
//! stops the poller, because the message may already have been sent from an app opened by an
//! earlier attempt. Verification success always wins.

use std::{sync::Arc, time::Duration};

use chathandoff_core::{
    AppVariant, Clock, CodeStore, FailureKind, InitRequest, KeyValueStore, LaunchAttempt,
    LaunchPayload, OpenVerdict, Platform, PreferenceStore, VerificationResult, parse_dispatch_url,
};
use tracing::{info, warn};

use crate::{
    ClientError,
    backend::{BackendError, VerificationBackend},
    config::HandoffConfig,
    dispatch::{Launch, LaunchDispatcher},
    navigator::Navigator,
    poller::{PollPhase, PollStatus, PollSubscription, PollerSettings, SessionSink},
    visibility::VisibilitySource,
    watch::OpenWatch,
};

/// Capabilities a hand-off runs against.
#[derive(Clone)]
pub struct HandoffDeps {
    pub backend: Arc<dyn VerificationBackend>,
    pub store: Arc<dyn KeyValueStore>,
    pub navigator: Arc<dyn Navigator>,
    pub visibility: Arc<dyn VisibilitySource>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn SessionSink>,
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStart {
    pub code: String,
    pub resumed: bool,
    /// What to launch now, if anything. A resumed flow whose app was already opened has
    /// nothing to launch.
    pub launch: Option<LaunchPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCheck {
    Verified,
    Restart,
}

/// Obtains (or resumes) the verification code.
#[derive(Clone)]
pub struct VerificationFlow {
    backend: Arc<dyn VerificationBackend>,
    prefs: PreferenceStore,
    codes: CodeStore,
}

impl VerificationFlow {
    pub fn new(backend: Arc<dyn VerificationBackend>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            prefs: PreferenceStore::new(store.clone()),
            codes: CodeStore::new(store),
        }
    }

    pub fn codes(&self) -> &CodeStore {
        &self.codes
    }

    /// Reuse the code already in flight, or ask the backend for a new one. Reusing matters:
    /// a message the user already sent only matches the code it carried.
    pub async fn begin(
        &self,
        referral_code: Option<&str>,
        variant: Option<AppVariant>,
    ) -> Result<FlowStart, BackendError> {
        if let Some(code) = self.codes.code() {
            info!(code = %code, "resuming in-flight verification");
            return Ok(FlowStart {
                launch: self.codes.take_pending_dispatch(),
                code,
                resumed: true,
            });
        }

        if let Some(referral) = referral_code.map(str::trim).filter(|r| !r.is_empty())
            && let Err(err) = self.codes.set_referral_code(referral)
        {
            warn!("failed to remember referral code: {err}");
        }

        // Someone who already picked an app has signed up before; referrals only count once.
        let stored = self.prefs.get();
        let referral_code = if stored.is_some() {
            None
        } else {
            self.codes.referral_code()
        };
        let request = InitRequest {
            referral_code,
            is_business: variant.or(stored) == Some(AppVariant::Business),
        };

        let response = self.backend.init(&request).await?;
        info!(code = %response.code, "verification code issued");

        if let Err(err) = self.codes.set_code(&response.code) {
            warn!("failed to persist verification code: {err}");
        }
        if let Err(err) = self.codes.set_pending_dispatch(&response.dispatch_url) {
            warn!("failed to persist pending dispatch url: {err}");
        }
        let launch = self
            .codes
            .take_pending_dispatch()
            .or_else(|| parse_dispatch_url(&response.dispatch_url));

        Ok(FlowStart {
            code: response.code,
            resumed: false,
            launch,
        })
    }

    /// A code that arrived through a verify link: one check, no polling.
    pub async fn check_link_code(&self, code: &str, sink: &dyn SessionSink) -> LinkCheck {
        match self.backend.status(code).await {
            Ok(VerificationResult {
                verified: true,
                session_token: Some(session_token),
                profile,
            }) => {
                sink.accept(session_token, profile);
                if let Err(err) = self.codes.clear_after_verification() {
                    warn!("failed to clear verification state: {err}");
                }
                LinkCheck::Verified
            }
            Ok(_) => LinkCheck::Restart,
            Err(err) => {
                warn!(code, "verify link check failed: {err}");
                LinkCheck::Restart
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStep {
    /// The session was handed to the sink.
    Authenticated,
    /// The app did not open (or polling gave up); ask the user to pick again.
    ReturnToPicker,
    /// The code is dead; start over with a fresh one.
    RestartFlow,
}

enum HandoffEvent {
    Poll(PollPhase),
    Open(Option<OpenVerdict>),
}

pub struct Handoff {
    dispatcher: LaunchDispatcher,
    flow: VerificationFlow,
    poller: PollSubscription,
    open_watch: Option<OpenWatch>,
    failed_open: Option<FailureKind>,
    gave_up_reported: bool,
    last_attempt: Option<LaunchAttempt>,
    relaunch_payload: LaunchPayload,
    grace: Duration,
    backend: Arc<dyn VerificationBackend>,
    sink: Arc<dyn SessionSink>,
    visibility: Arc<dyn VisibilitySource>,
    clock: Arc<dyn Clock>,
    poller_settings: PollerSettings,
}

impl Handoff {
    /// Obtain a code, start polling for it and fire the pending launch, if any.
    pub async fn start(
        config: &HandoffConfig,
        deps: HandoffDeps,
        referral_code: Option<&str>,
        variant: Option<AppVariant>,
    ) -> Result<Self, ClientError> {
        let flow = VerificationFlow::new(deps.backend.clone(), deps.store.clone());
        let start = flow.begin(referral_code, variant).await?;

        let dispatcher = LaunchDispatcher::new(
            config.link_schemes.clone(),
            deps.platform,
            config.verifier,
            PreferenceStore::new(deps.store.clone()),
            deps.navigator.clone(),
            deps.visibility.clone(),
            deps.clock.clone(),
        );
        let poller = PollSubscription::start(
            start.code.clone(),
            deps.backend.clone(),
            deps.sink.clone(),
            deps.visibility.subscribe(),
            config.poller,
            deps.clock.clone(),
        );
        let relaunch_payload = LaunchPayload::ChatWithNumber {
            phone: config.service_phone.clone(),
            text: config.code_message(&start.code),
        };

        let mut handoff = Self {
            dispatcher,
            flow,
            poller,
            open_watch: None,
            failed_open: None,
            gave_up_reported: false,
            last_attempt: None,
            relaunch_payload,
            grace: config.grace(),
            backend: deps.backend,
            sink: deps.sink,
            visibility: deps.visibility,
            clock: deps.clock,
            poller_settings: config.poller,
        };

        match start.launch {
            Some(payload) => {
                handoff.launch(payload, variant);
            }
            None if start.resumed => {
                info!(code = %start.code, "app was already opened for this code; waiting only");
            }
            None => warn!(code = %start.code, "backend issued no usable dispatch url"),
        }
        Ok(handoff)
    }

    pub fn code(&self) -> &str {
        self.poller.code()
    }

    pub fn poll_status(&self) -> PollStatus {
        self.poller.status()
    }

    pub fn last_attempt(&self) -> Option<&LaunchAttempt> {
        self.last_attempt.as_ref()
    }

    pub fn preferences(&self) -> &PreferenceStore {
        self.dispatcher.preferences()
    }

    /// "Open the app again": same code, same message, possibly a newly picked variant.
    pub fn relaunch(&mut self, variant: Option<AppVariant>) -> &LaunchAttempt {
        if self.poller.status().phase == PollPhase::GaveUp {
            info!(code = %self.poller.code(), "restarting verification polling for relaunch");
            self.poller = PollSubscription::start(
                self.poller.code().to_owned(),
                self.backend.clone(),
                self.sink.clone(),
                self.visibility.subscribe(),
                self.poller_settings,
                self.clock.clone(),
            );
            self.gave_up_reported = false;
        }

        let payload = self
            .last_attempt
            .as_ref()
            .map(|attempt| attempt.payload.clone())
            .unwrap_or_else(|| self.relaunch_payload.clone());
        self.launch(payload, variant)
    }

    fn launch(&mut self, payload: LaunchPayload, variant: Option<AppVariant>) -> &LaunchAttempt {
        // The previous watch must be gone before the new pick is written.
        self.open_watch = None;
        let Launch { attempt, watch } = self.dispatcher.dispatch(payload, variant);
        self.open_watch = Some(watch);
        self.failed_open = None;
        self.last_attempt.insert(attempt)
    }

    /// Wait for whatever decides the next screen. Cancel-safe: a failed open that was seen
    /// but not yet reported is kept for the next call. Once a give-up has been reported this
    /// waits for a relaunch instead of reporting it again.
    pub async fn next_step(&mut self) -> HandoffStep {
        loop {
            if let Some(kind) = self.failed_open {
                let waited = tokio::time::timeout(self.grace, self.poller.wait_terminal()).await;
                self.failed_open = None;
                return match waited {
                    Ok(phase) => self.conclude(phase),
                    Err(_) => {
                        info!(
                            code = %self.poller.code(),
                            failure = ?kind,
                            "app did not open; returning to picker while polling continues"
                        );
                        HandoffStep::ReturnToPicker
                    }
                };
            }

            let event = {
                let poller = &mut self.poller;
                let open_watch = &mut self.open_watch;
                let polling = !self.gave_up_reported;
                tokio::select! {
                    biased;
                    phase = poller.wait_terminal(), if polling => HandoffEvent::Poll(phase),
                    verdict = wait_open_verdict(open_watch) => HandoffEvent::Open(verdict),
                }
            };

            match event {
                HandoffEvent::Poll(phase) => return self.conclude(phase),
                HandoffEvent::Open(verdict) => {
                    self.open_watch = None;
                    if let Some(OpenVerdict::Failed(kind)) = verdict {
                        self.failed_open = Some(kind);
                    }
                }
            }
        }
    }

    fn conclude(&mut self, phase: PollPhase) -> HandoffStep {
        let codes = self.flow.codes();
        match phase {
            PollPhase::Verified => {
                self.open_watch = None;
                if let Err(err) = codes.clear_after_verification() {
                    warn!("failed to clear verification state: {err}");
                }
                HandoffStep::Authenticated
            }
            PollPhase::Expired => {
                if let Err(err) = codes.clear_code() {
                    warn!("failed to drop expired verification code: {err}");
                }
                HandoffStep::RestartFlow
            }
            PollPhase::GaveUp => {
                info!(code = %self.poller.code(), "stopped polling; relaunch to resume");
                self.gave_up_reported = true;
                HandoffStep::ReturnToPicker
            }
            PollPhase::Polling => HandoffStep::ReturnToPicker,
        }
    }
}

async fn wait_open_verdict(open_watch: &mut Option<OpenWatch>) -> Option<OpenVerdict> {
    match open_watch {
        Some(watch) => watch.verdict().await,
        None => std::future::pending().await,
    }
}
