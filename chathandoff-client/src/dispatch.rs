use std::sync::Arc;

use chathandoff_core::{
    AppVariant, Clock, LaunchAttempt, LaunchPayload, LinkSchemes, Platform, PreferenceStore,
    VerifierTimings,
};
use tracing::{info, warn};

use crate::{
    navigator::Navigator,
    visibility::VisibilitySource,
    watch::{LaunchEpoch, OpenWatch},
};

/// A fired deep link together with the watch judging whether it worked.
#[derive(Debug)]
pub struct Launch {
    pub attempt: LaunchAttempt,
    pub watch: OpenWatch,
}

/// Picks the link for a payload and fires it. Never prompts: when the user has to be asked,
/// the caller does that first and passes the answer in.
#[derive(Clone)]
pub struct LaunchDispatcher {
    schemes: LinkSchemes,
    platform: Platform,
    timings: VerifierTimings,
    prefs: PreferenceStore,
    navigator: Arc<dyn Navigator>,
    visibility: Arc<dyn VisibilitySource>,
    clock: Arc<dyn Clock>,
    epoch: LaunchEpoch,
}

impl LaunchDispatcher {
    pub fn new(
        schemes: LinkSchemes,
        platform: Platform,
        timings: VerifierTimings,
        prefs: PreferenceStore,
        navigator: Arc<dyn Navigator>,
        visibility: Arc<dyn VisibilitySource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schemes,
            platform,
            timings,
            prefs,
            navigator,
            visibility,
            clock,
            epoch: LaunchEpoch::default(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.prefs
    }

    /// The variant a launch would use right now, and the URI it would fire.
    pub fn resolve(
        &self,
        payload: &LaunchPayload,
        preferred: Option<AppVariant>,
    ) -> (Option<AppVariant>, String) {
        let variant = preferred.or_else(|| self.prefs.get());
        let uri = match (variant, payload) {
            (Some(variant), _) => self.schemes.build(variant, self.platform, payload),
            // Before anyone has picked, a number-addressed chat still works through the
            // app-agnostic link.
            (None, LaunchPayload::ChatWithNumber { .. }) => self.schemes.universal(payload),
            (None, LaunchPayload::ShareText { .. }) => {
                self.schemes.build(AppVariant::Personal, self.platform, payload)
            }
        };
        (variant, uri)
    }

    pub fn dispatch(&self, payload: LaunchPayload, preferred: Option<AppVariant>) -> Launch {
        let launch = self.epoch.advance(|| {
            if let Some(variant) = preferred
                && let Err(err) = self.prefs.set(variant)
            {
                warn!(%variant, "failed to remember picked app variant: {err}");
            }
        });

        let (variant, uri) = self.resolve(&payload, preferred);
        let attempt = LaunchAttempt {
            variant,
            platform: self.platform,
            launched_at_ms: self.clock.now_ms(),
            payload,
            uri,
        };

        // Listener first, navigation second: no transition caused by the launch can slip by.
        let listener = self.visibility.subscribe();
        let watch = OpenWatch::spawn(
            &attempt,
            self.timings,
            listener,
            self.clock.clone(),
            self.prefs.clone(),
            self.epoch.clone(),
            launch,
        );

        info!(
            variant = ?attempt.variant,
            platform = %attempt.platform,
            universal = attempt.variant.is_none(),
            "dispatching deep link"
        );
        self.navigator.navigate(&attempt.uri);

        Launch { attempt, watch }
    }
}
