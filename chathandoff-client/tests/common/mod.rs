#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chathandoff_client::{
    BackendError, HandoffConfig, HandoffDeps, Navigator, PageVisibility, SessionSink, TokioClock,
    VerificationBackend,
};
use chathandoff_core::{
    InitRequest, InitResponse, KeyValueStore, MemoryStore, Platform, VerificationResult,
};

pub const CODE: &str = "123456";
pub const SERVICE_PHONE: &str = "15550100000";
pub const DISPATCH_URL: &str = "https://wa.me/15550100000?text=VERIFY%20123456";

/// Scripted backend. Status answers are served in order; once the script runs out every
/// poll is answered with "not yet".
pub struct FakeBackend {
    init_response: InitResponse,
    statuses: Mutex<VecDeque<Result<VerificationResult, BackendError>>>,
    init_requests: Mutex<Vec<InitRequest>>,
    status_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            init_response: InitResponse {
                code: CODE.to_owned(),
                dispatch_url: DISPATCH_URL.to_owned(),
            },
            statuses: Mutex::new(VecDeque::new()),
            init_requests: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, result: Result<VerificationResult, BackendError>) -> Self {
        self.statuses.lock().unwrap().push_back(result);
        self
    }

    pub fn pending_times(self, times: usize) -> Self {
        (0..times).fold(self, |backend, _| {
            backend.then(Ok(VerificationResult::pending()))
        })
    }

    pub fn failing_times(self, times: usize) -> Self {
        (0..times).fold(self, |backend, _| {
            backend.then(Err(BackendError::Transport("connection reset".to_owned())))
        })
    }

    pub fn verified(self, token: &str) -> Self {
        self.then(Ok(VerificationResult::verified(
            token,
            Some(serde_json::json!({ "name": "Ada" })),
        )))
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn init_requests(&self) -> Vec<InitRequest> {
        self.init_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl VerificationBackend for FakeBackend {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, BackendError> {
        self.init_requests.lock().unwrap().push(request.clone());
        Ok(self.init_response.clone())
    }

    async fn status(&self, _code: &str) -> Result<VerificationResult, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(VerificationResult::pending()))
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    uris: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, uri: &str) {
        self.uris.lock().unwrap().push(uri.to_owned());
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sessions: Mutex<Vec<(String, Option<serde_json::Value>)>>,
}

impl RecordingSink {
    pub fn tokens(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(token, _)| token.clone())
            .collect()
    }

    pub fn sessions(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.sessions.lock().unwrap().clone()
    }
}

impl SessionSink for RecordingSink {
    fn accept(&self, session_token: String, profile: Option<serde_json::Value>) {
        self.sessions.lock().unwrap().push((session_token, profile));
    }
}

/// Everything a hand-off touches, kept concrete so tests can inspect it.
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub store: Arc<MemoryStore>,
    pub navigator: Arc<RecordingNavigator>,
    pub visibility: Arc<PageVisibility>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<TokioClock>,
}

impl Harness {
    pub fn new(backend: FakeBackend) -> Self {
        Self {
            backend: Arc::new(backend),
            store: Arc::new(MemoryStore::new()),
            navigator: Arc::new(RecordingNavigator::default()),
            visibility: Arc::new(PageVisibility::default()),
            sink: Arc::new(RecordingSink::default()),
            clock: Arc::new(TokioClock::new()),
        }
    }

    pub fn deps(&self, platform: Platform) -> HandoffDeps {
        HandoffDeps {
            backend: self.backend.clone(),
            store: self.store.clone(),
            navigator: self.navigator.clone(),
            visibility: self.visibility.clone(),
            clock: self.clock.clone(),
            sink: self.sink.clone(),
            platform,
        }
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }
}

pub fn test_config() -> HandoffConfig {
    HandoffConfig {
        service_phone: SERVICE_PHONE.to_owned(),
        ..HandoffConfig::default()
    }
}
