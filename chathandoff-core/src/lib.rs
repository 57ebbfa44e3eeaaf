use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod link;
pub mod prefs;
pub mod verifier;

pub use link::{LinkSchemes, build, parse_dispatch_url};
pub use prefs::{CodeStore, FileStore, KeyValueStore, MemoryStore, PreferenceStore, StoreError};
pub use verifier::{
    FailureKind, OpenVerdict, OpenVerifier, VerifierState, VerifierTimings, Visibility, classify,
};

pub type VerificationCode = String;

/// Which identity of the external chat app a launch targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AppVariant {
    Personal,
    Business,
}

impl AppVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            AppVariant::Personal => "personal",
            AppVariant::Business => "business",
        }
    }

    /// Strict parse of a persisted value. Anything else is foreign data.
    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "personal" => Some(AppVariant::Personal),
            "business" => Some(AppVariant::Business),
            _ => None,
        }
    }
}

impl fmt::Display for AppVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppVariant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppVariant::from_stored(s.trim().to_ascii_lowercase().as_str())
            .ok_or_else(|| CoreError::UnknownVariant(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[serde(rename = "ios")]
    IosLike,
    #[serde(rename = "android")]
    AndroidLike,
    Other,
}

impl Platform {
    /// Classify a browser user agent. Android wins over iOS markers because some Android
    /// tablets advertise both.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ua.contains("android") {
            Platform::AndroidLike
        } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ipod") {
            Platform::IosLike
        } else {
            Platform::Other
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::IosLike => "ios",
            Platform::AndroidLike => "android",
            Platform::Other => "other",
        };
        f.write_str(name)
    }
}

impl FromStr for Platform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::IosLike),
            "android" => Ok(Platform::AndroidLike),
            "other" => Ok(Platform::Other),
            _ => Err(CoreError::UnknownPlatform(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchPayload {
    ShareText { text: String },
    ChatWithNumber { phone: String, text: String },
}

impl LaunchPayload {
    pub fn text(&self) -> &str {
        match self {
            LaunchPayload::ShareText { text } | LaunchPayload::ChatWithNumber { text, .. } => text,
        }
    }

    pub fn phone(&self) -> Option<&str> {
        match self {
            LaunchPayload::ShareText { .. } => None,
            LaunchPayload::ChatWithNumber { phone, .. } => Some(phone),
        }
    }
}

/// One fired deep link. `variant` is `None` when the app-agnostic universal link was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchAttempt {
    pub variant: Option<AppVariant>,
    pub platform: Platform,
    pub launched_at_ms: u64,
    pub payload: LaunchPayload,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationSession {
    pub code: VerificationCode,
    pub started_at_ms: u64,
    pub attempts_made: u32,
}

impl VerificationSession {
    pub fn new(code: impl Into<VerificationCode>, started_at_ms: u64) -> Self {
        Self {
            code: code.into(),
            started_at_ms,
            attempts_made: 0,
        }
    }

    pub fn record_failed_attempt(&mut self) -> u32 {
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.attempts_made
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    pub is_business: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub code: VerificationCode,
    #[serde(alias = "whatsapp_url")]
    pub dispatch_url: String,
}

/// Backend answer for a status poll. Older deployments send `token`/`agent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub verified: bool,
    #[serde(default, alias = "token", skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, alias = "agent", skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
}

impl VerificationResult {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn verified(session_token: impl Into<String>, profile: Option<serde_json::Value>) -> Self {
        Self {
            verified: true,
            session_token: Some(session_token.into()),
            profile,
        }
    }
}

/// Monotonic millisecond source. Everything time-dependent in the handoff reads this.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown app variant {0:?} (expected personal or business)")]
    UnknownVariant(String),
    #[error("unknown platform {0:?} (expected ios, android or other)")]
    UnknownPlatform(String),
    #[error(
        "bounce threshold ({bounce_ms} ms) must be positive and shorter than the open timeout ({max_ms} ms)"
    )]
    InvalidTimings { bounce_ms: u64, max_ms: u64 },
}
