use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chathandoff_core::{LinkSchemes, VerifierTimings};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::poller::PollerSettings;

pub const CONFIG_DIR_ENV: &str = "CHATHANDOFF_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "CHATHANDOFF_DATA_DIR";
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

const MAX_SERVICE_PHONE_LEN: usize = 20;
const MAX_MESSAGE_PREFIX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path} failed: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("config file {path} too large: {size} bytes (max {max})")]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("parse {path} failed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Please fix the following:\n\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandoffConfig {
    /// Base of the verification API; `verification/...` paths are appended to it.
    pub api_base_url: String,
    /// Number the pre-filled verification message is addressed to.
    pub service_phone: String,
    /// Text placed before the code when the message has to be rebuilt locally.
    pub code_message_prefix: String,
    pub request_timeout_ms: u64,
    /// How long a failed open may wait for a verification that is already on its way.
    pub grace_ms: u64,
    pub link_schemes: LinkSchemes,
    pub verifier: VerifierTimings,
    pub poller: PollerSettings,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api/v1".to_owned(),
            service_phone: "15550100000".to_owned(),
            code_message_prefix: "VERIFY".to_owned(),
            request_timeout_ms: 10_000,
            grace_ms: 200,
            link_schemes: LinkSchemes::default(),
            verifier: VerifierTimings::default(),
            poller: PollerSettings::default(),
        }
    }
}

impl HandoffConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// The message the backend expects for `code`, for relaunches without a dispatch url.
    pub fn code_message(&self, code: &str) -> String {
        format!("{} {code}", self.code_message_prefix.trim())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let base = self.api_base_url.trim();
        if base.is_empty() {
            errors.push("API base URL is required.".to_owned());
        } else {
            match Url::parse(base) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(_) => {
                    errors.push("API base URL must start with http:// or https://.".to_owned())
                }
                Err(err) => errors.push(format!("API base URL is invalid: {err}")),
            }
        }

        let phone = self.service_phone.trim();
        if phone.is_empty() {
            errors.push("Service phone is required.".to_owned());
        } else if phone.len() > MAX_SERVICE_PHONE_LEN {
            errors.push(format!(
                "Service phone is too long ({} > {} digits).",
                phone.len(),
                MAX_SERVICE_PHONE_LEN
            ));
        } else if !phone.chars().all(|c| c.is_ascii_digit()) {
            errors.push(
                "Service phone must contain digits only (international format, no +).".to_owned(),
            );
        }

        let prefix = self.code_message_prefix.trim();
        if prefix.is_empty() {
            errors.push("Code message prefix is required.".to_owned());
        } else if prefix.len() > MAX_MESSAGE_PREFIX_LEN {
            errors.push(format!(
                "Code message prefix is too long ({} > {} chars).",
                prefix.len(),
                MAX_MESSAGE_PREFIX_LEN
            ));
        }

        for (name, value) in [
            ("personal scheme", &self.link_schemes.personal_scheme),
            ("business scheme", &self.link_schemes.business_scheme),
            ("business package", &self.link_schemes.business_package),
            ("universal host", &self.link_schemes.universal_host),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("Link {name} is required."));
            }
        }

        if let Err(err) = self.verifier.validate() {
            errors.push(format!("Verifier timings: {err}."));
        }
        if self.poller.interval_ms == 0 {
            errors.push("Poll interval must be positive.".to_owned());
        }
        if self.request_timeout_ms == 0 {
            errors.push("Request timeout must be positive.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

fn base_dir() -> PathBuf {
    std::env::var_os("LOCALAPPDATA")
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
        })
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ChatHandoff")
}

pub fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(base_dir)
}

pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(base_dir)
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Where preferences and the in-flight code live between runs.
pub fn store_path() -> PathBuf {
    data_dir().join("store.json")
}

/// Missing file means defaults; a present file must parse and validate.
pub fn load_config_from_path(path: &Path) -> Result<HandoffConfig, ConfigError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HandoffConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: HandoffConfig =
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<HandoffConfig, ConfigError> {
    load_config_from_path(&config_path())
}
