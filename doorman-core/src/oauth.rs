//! CTFtime OAuth: the verification `state` codec, the authorize URL and the
//! two calls needed to turn a callback code into a CTFtime user id.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::http_log::RequestLogMiddleware;

pub const DEFAULT_OAUTH_HOST: &str = "oauth.ctftime.org";
pub const OAUTH_SCOPE: &str = "profile:read";

#[derive(Debug, Error)]
pub enum StateDecodeError {
    #[error("state is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque value carried through the OAuth round trip.
///
/// `user_id` is the member's internal id, never the Telegram user id, so a
/// state cannot be forged from public information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationState {
    pub user_id: String,
    pub chat_id: i64,
}

impl VerificationState {
    pub fn new(user_id: impl Into<String>, chat_id: i64) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id,
        }
    }

    /// URL-safe base64 (padded) of the JSON encoding.
    pub fn encode(&self) -> String {
        // Serializing a struct of a String and an i64 cannot fail.
        let raw = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE.encode(raw)
    }

    /// Accepts both padded and unpadded input; some clients strip `=`.
    pub fn decode(value: &str) -> Result<Self, StateDecodeError> {
        let raw = match URL_SAFE.decode(value) {
            Ok(raw) => raw,
            Err(_) => URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))?,
        };
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State(user={}, chat={})", self.user_id, self.chat_id)
    }
}

/// Static OAuth application settings.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub host: String,
    pub client_id: String,
    pub redirect_url: String,
}

impl OAuthSettings {
    fn base_url(&self) -> Result<Url> {
        Url::parse(&format!("https://{}", self.host))
            .with_context(|| format!("Invalid OAuth host: {}", self.host))
    }

    /// Link that sends the user to CTFtime to grant `profile:read`.
    pub fn authorize_url(&self, state: &VerificationState) -> Result<Url> {
        let mut url = self.base_url()?.join("/authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("scope", OAUTH_SCOPE)
            .append_pair("response_type", "code")
            .append_pair("state", &state.encode());
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: i64,
}

#[derive(Clone)]
pub struct CtfTimeClient {
    client: ClientWithMiddleware,
    settings: OAuthSettings,
    client_secret: String,
}

impl CtfTimeClient {
    pub fn new(settings: OAuthSettings, client_secret: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("doorman/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client: ClientBuilder::new(client)
                .with(RequestLogMiddleware::new("ctftime"))
                .build(),
            settings,
            client_secret: client_secret.into(),
        }
    }

    /// Trade an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        let url = self.settings.base_url()?.join("/token")?;
        let response = self
            .client
            .post(url)
            .query(&[
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.settings.redirect_url.as_str()),
            ])
            .send()
            .await
            .context("Failed to send token request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("CTFtime token API error: {} - {}", status, body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;
        Ok(token.access_token)
    }

    /// Look up the CTFtime user id the token belongs to.
    pub async fn fetch_user_id(&self, access_token: &str) -> Result<i64> {
        let url = self.settings.base_url()?.join("/user")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send user request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("CTFtime user API error: {} - {}", status, body));
        }

        let user: UserResponse = response
            .json()
            .await
            .context("Failed to parse user response")?;
        Ok(user.id)
    }

    /// Code in, CTFtime user id out.
    pub async fn resolve(&self, code: &str) -> Result<i64> {
        let token = self.exchange_code(code).await?;
        let user_id = self.fetch_user_id(&token).await?;
        info!(ctftime_user_id = user_id, "resolved CTFtime identity");
        Ok(user_id)
    }
}
