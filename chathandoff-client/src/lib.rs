use thiserror::Error;

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod handoff;
pub mod logging;
pub mod navigator;
pub mod poller;
pub mod visibility;
pub mod watch;

pub use backend::{BackendError, HttpBackend, VerificationBackend};
pub use config::{ConfigError, HandoffConfig};
pub use dispatch::{Launch, LaunchDispatcher};
pub use handoff::{Handoff, HandoffDeps, HandoffStep, LinkCheck, VerificationFlow};
pub use navigator::{LogNavigator, Navigator, SystemNavigator};
pub use poller::{PollPhase, PollStatus, PollSubscription, PollerSettings, SessionSink};
pub use visibility::{PageVisibility, TokioClock, VisibilitySource};
pub use watch::OpenWatch;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] chathandoff_core::StoreError),
    #[error(transparent)]
    Core(#[from] chathandoff_core::CoreError),
}
