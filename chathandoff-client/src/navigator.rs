use tracing::{info, warn};

/// Hands a URI to whatever can switch the foreground app. Fire-and-forget: success of the
/// switch is only ever inferred afterwards from visibility.
pub trait Navigator: Send + Sync {
    fn navigate(&self, uri: &str);
}

/// Opens the URI with the operating system's default handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNavigator;

impl Navigator for SystemNavigator {
    fn navigate(&self, uri: &str) {
        info!(uri, "opening deep link");
        if let Err(err) = open::that_detached(uri) {
            warn!(uri, "system opener refused deep link: {err}");
        }
    }
}

/// Only records the URI in the log; for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, uri: &str) {
        info!(uri, "deep link ready (not opened)");
    }
}
