use drive_core::{OAuthClient, OAuthError};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Credentials;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] OAuthError),
    #[error("token endpoint returned an empty access token")]
    EmptyToken,
}

/// Turns configured credentials into a bearer token for this run.
///
/// A run is short, so the token is resolved once and never refreshed again.
pub async fn resolve_access_token(
    credentials: &Credentials,
    oauth_base_url: Option<&str>,
) -> Result<String, AuthError> {
    match credentials {
        Credentials::AccessToken(token) => Ok(token.clone()),
        Credentials::Refresh {
            client_id,
            client_secret,
            refresh_token,
        } => {
            let client = match oauth_base_url {
                Some(url) => OAuthClient::with_base_url(url, client_id, client_secret)?,
                None => OAuthClient::new(client_id, client_secret)?,
            };
            let token = client.refresh_token(refresh_token).await.inspect_err(|err| {
                if err.is_revoked() {
                    warn!("refresh token was revoked, a new one has to be issued");
                }
            })?;
            if token.access_token.is_empty() {
                return Err(AuthError::EmptyToken);
            }
            info!(expires_in = ?token.expires_in, "refreshed access token");
            Ok(token.access_token)
        }
    }
}
