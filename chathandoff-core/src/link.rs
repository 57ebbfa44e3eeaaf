//! Deep link rendering for the external chat app.
//!
//! Every function here is pure: no storage, no network, same input same URI.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{AppVariant, LaunchPayload, Platform};

pub const DEFAULT_PERSONAL_SCHEME: &str = "whatsapp";
pub const DEFAULT_BUSINESS_SCHEME: &str = "whatsapp-smb";
pub const DEFAULT_BUSINESS_PACKAGE: &str = "com.whatsapp.w4b";
pub const DEFAULT_UNIVERSAL_HOST: &str = "wa.me";

/// URI schemes and package names the OS knows the two app identities by.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LinkSchemes {
    pub personal_scheme: String,
    pub business_scheme: String,
    pub business_package: String,
    pub universal_host: String,
}

impl Default for LinkSchemes {
    fn default() -> Self {
        Self {
            personal_scheme: DEFAULT_PERSONAL_SCHEME.to_owned(),
            business_scheme: DEFAULT_BUSINESS_SCHEME.to_owned(),
            business_package: DEFAULT_BUSINESS_PACKAGE.to_owned(),
            universal_host: DEFAULT_UNIVERSAL_HOST.to_owned(),
        }
    }
}

impl LinkSchemes {
    /// Render the launch URI for a variant on a platform.
    ///
    /// Business on Android uses an intent URI that names the package, so the OS resolves it
    /// without a chooser. Business on an unknown platform has no reliable scheme and falls
    /// back to the personal form.
    pub fn build(
        &self,
        variant: AppVariant,
        platform: Platform,
        payload: &LaunchPayload,
    ) -> String {
        let query = send_query(payload);
        match (variant, platform) {
            (AppVariant::Business, Platform::AndroidLike) => format!(
                "intent://send?{query}#Intent;scheme={};package={};end",
                self.business_scheme, self.business_package
            ),
            (AppVariant::Business, Platform::IosLike) => {
                format!("{}://send?{query}", self.business_scheme)
            }
            (AppVariant::Personal, _) | (AppVariant::Business, Platform::Other) => {
                format!("{}://send?{query}", self.personal_scheme)
            }
        }
    }

    /// App-agnostic https link; the OS routes it to whichever identity is installed.
    pub fn universal(&self, payload: &LaunchPayload) -> String {
        let text = urlencoding::encode(payload.text());
        match payload.phone() {
            Some(phone) => format!(
                "https://{}/{}?text={text}",
                self.universal_host,
                urlencoding::encode(phone)
            ),
            None => format!("https://{}/?text={text}", self.universal_host),
        }
    }
}

/// [`LinkSchemes::build`] with the stock schemes.
pub fn build(variant: AppVariant, platform: Platform, payload: &LaunchPayload) -> String {
    LinkSchemes::default().build(variant, platform, payload)
}

fn send_query(payload: &LaunchPayload) -> String {
    let text = urlencoding::encode(payload.text());
    match payload.phone() {
        Some(phone) => format!("phone={}&text={text}", urlencoding::encode(phone)),
        None => format!("text={text}"),
    }
}

/// Recover the chat target from a backend-issued universal link such as
/// `https://wa.me/15550100000?text=VERIFY%20123456`.
pub fn parse_dispatch_url(dispatch_url: &str) -> Option<LaunchPayload> {
    let url = Url::parse(dispatch_url.trim()).ok()?;
    let text = url
        .query_pairs()
        .find(|(key, _)| key == "text")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();
    let phone = url
        .path_segments()
        .and_then(|mut segments| segments.next())
        .map(str::to_owned)
        .unwrap_or_default();

    if phone.is_empty() {
        Some(LaunchPayload::ShareText { text })
    } else {
        Some(LaunchPayload::ChatWithNumber { phone, text })
    }
}
