use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://oauth2.googleapis.com";
const TOKEN_PATH: &str = "/token";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    /// The token endpoint answered with its structured error body.
    #[error("token endpoint refused the grant ({status}): {code}{}", describe(.description))]
    Refused {
        status: StatusCode,
        code: String,
        description: Option<String>,
    },
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl OAuthError {
    /// True when the refresh token itself is no longer valid and a new
    /// consent is needed.
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Refused { code, .. } if code == "invalid_grant")
    }
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|text| format!(" ({text})"))
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchanges a long-lived refresh token for short-lived access tokens.
#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_url(DEFAULT_BASE_URL, client_id, client_secret)
    }

    pub fn with_base_url(
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            token_url: Url::parse(base_url)?.join(TOKEN_PATH)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<OAuthToken>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => OAuthError::Refused {
                status,
                code: parsed.error,
                description: parsed.error_description,
            },
            Err(_) => OAuthError::Api { status, body },
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    /// Lifetime in seconds from the moment the token was issued.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}
