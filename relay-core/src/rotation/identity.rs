use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::TokenType;
use crate::error::IdentityError;

/// A freshly issued credential.
#[derive(Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_on: DateTime<Utc>,
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("access_token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// External capability that can mint a new token for a platform.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn refresh_token(&self, token: TokenType) -> Result<RefreshedToken, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth2 `refresh_token` grant against a token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthRefreshProvider {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl OAuthRefreshProvider {
    pub fn new(
        client: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for OAuthRefreshProvider {
    async fn refresh_token(&self, token: TokenType) -> Result<RefreshedToken, IdentityError> {
        debug!(token = %token, url = %self.token_url, "requesting token refresh");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let resp = self.client.post(&self.token_url).form(&form).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            let reason = match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(desc) => format!("{status}: {} ({desc})", err.error),
                    None => format!("{status}: {}", err.error),
                },
                Err(_) => format!("{status}"),
            };
            return Err(IdentityError::Refused(reason));
        }
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| IdentityError::Refused(format!("unreadable token response: {err}")))?;
        if parsed.expires_in <= 0 {
            return Err(IdentityError::Refused(format!(
                "token expires_in {} is not in the future",
                parsed.expires_in
            )));
        }
        let expires_on = Duration::try_seconds(parsed.expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                IdentityError::Refused(format!("token expires_in {} is out of range", parsed.expires_in))
            })?;
        Ok(RefreshedToken {
            access_token: parsed.access_token,
            expires_on,
        })
    }
}
