use std::time::Duration;

use async_trait::async_trait;
use chathandoff_core::{InitRequest, InitResponse, VerificationResult};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("backend answered {status}")]
    Status { status: u16 },
    #[error("verification code {code} is unknown or expired")]
    CodeNotFound { code: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl BackendError {
    /// Only an unknown code ends a poll loop; everything else is worth another try.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            BackendError::CodeNotFound { .. } | BackendError::InvalidBaseUrl { .. }
        )
    }
}

/// The server half of the verification handshake.
#[async_trait]
pub trait VerificationBackend: Send + Sync {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, BackendError>;

    /// Must be safe to call repeatedly; it only reads.
    async fn status(&self, code: &str) -> Result<VerificationResult, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let invalid = |reason: String| BackendError::InvalidBaseUrl {
            url: base_url.to_owned(),
            reason,
        };
        let base = Url::parse(base_url.trim())
            .map_err(|err| invalid(err.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("url cannot carry a path".to_owned()));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidBaseUrl {
                url: self.base.to_string(),
                reason: "url cannot carry a path".to_owned(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn transport(err: reqwest::Error) -> BackendError {
    BackendError::Transport(err.to_string())
}

#[async_trait]
impl VerificationBackend for HttpBackend {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, BackendError> {
        let url = self.endpoint(&["verification", "init"])?;
        debug!(%url, is_business = request.is_business, "requesting verification code");
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
            });
        }
        response
            .json::<InitResponse>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn status(&self, code: &str) -> Result<VerificationResult, BackendError> {
        let url = self.endpoint(&["verification", "status", code])?;
        let response = self.client.get(url).send().await.map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(BackendError::CodeNotFound {
                code: code.to_owned(),
            }),
            status if !status.is_success() => Err(BackendError::Status {
                status: status.as_u16(),
            }),
            _ => response
                .json::<VerificationResult>()
                .await
                .map_err(|err| BackendError::Decode(err.to_string())),
        }
    }
}
