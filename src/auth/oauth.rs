//! OAuth2 authorization-code client for Azure AD.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::config::Config;
use crate::error::ExchangeError;
use crate::secure::SecureString;

/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Clock skew tolerated when checking id token expiry.
const ID_TOKEN_LEEWAY_SECS: i64 = 60;

/// Claims of a successful code exchange.
#[derive(Debug, Clone, Default)]
pub struct TokenResult {
    pub id_token_claims: Map<String, Value>,
}

impl TokenResult {
    /// The `preferred_username` claim, treated as the user's email.
    pub fn preferred_username(&self) -> Option<&str> {
        self.id_token_claims
            .get("preferred_username")
            .and_then(Value::as_str)
    }
}

/// The identity provider as seen by request handlers.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// URL the browser is sent to for sign-in.
    fn authorization_url(&self) -> Url;

    /// Exchange an authorization code for the id token claims.
    async fn exchange_code(&self, code: &str) -> Result<TokenResult, ExchangeError>;

    /// Provider-wide logout URL returning the browser to `post_logout_redirect_uri`.
    fn logout_url(&self, post_logout_redirect_uri: &str) -> Url;
}

/// Confidential OAuth2 client for a single Azure AD authority.
pub struct AzureAdClient {
    client_id: String,
    client_secret: SecureString,
    redirect_uri: String,
    scopes: Vec<String>,
    authorize_endpoint: Url,
    token_endpoint: Url,
    logout_endpoint: Url,
    http_client: reqwest::Client,
}

impl AzureAdClient {
    /// Create a new client from configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.oauth.exchange_timeout_secs))
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client_id: config.oauth.client_id.clone(),
            client_secret: config.oauth.client_secret.clone(),
            redirect_uri: config.oauth.redirect_uri.clone(),
            scopes: config.oauth.scopes.clone(),
            authorize_endpoint: Url::parse(&config.authorize_url())
                .context("Invalid authorize endpoint")?,
            token_endpoint: Url::parse(&config.token_url()).context("Invalid token endpoint")?,
            logout_endpoint: Url::parse(&config.logout_url())
                .context("Invalid logout endpoint")?,
            http_client,
        })
    }
}

#[async_trait]
impl IdentityProvider for AzureAdClient {
    fn authorization_url(&self) -> Url {
        let mut url = self.authorize_endpoint.clone();

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &self.scopes.join(" "));

        url
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResult, ExchangeError> {
        let scope = self.scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http_client
            .post(self.token_endpoint.clone())
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            // Log error details for debugging (doesn't expose to user)
            let error_body = response.text().await.unwrap_or_default();
            let error: Option<OAuthErrorBody> = serde_json::from_str(&error_body).ok();
            let code = error
                .as_ref()
                .map(|e| e.error.clone())
                .unwrap_or_else(|| "unknown".to_string());
            tracing::error!(
                status = status.as_u16(),
                error = %code,
                description = ?error.and_then(|e| e.error_description),
                "Token exchange failed"
            );
            return Err(ExchangeError::Provider {
                status: status.as_u16(),
                code,
            });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        let id_token = token_response
            .id_token
            .ok_or(ExchangeError::MissingIdToken)?;
        let id_token_claims = decode_id_token(&id_token, &self.client_id, Utc::now().timestamp())?;

        Ok(TokenResult { id_token_claims })
    }

    fn logout_url(&self, post_logout_redirect_uri: &str) -> Url {
        let mut url = self.logout_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("post_logout_redirect_uri", post_logout_redirect_uri);
        url
    }
}

/// Token response from Azure AD. Only the id token is consumed; the access
/// token is never used.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// Error body returned by the token endpoint.
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Decode the claims of an id token received directly from the token endpoint.
///
/// The token came over the TLS connection we opened ourselves, so only the
/// audience and expiry are checked; the signature is not verified.
pub fn decode_id_token(
    id_token: &str,
    client_id: &str,
    now: i64,
) -> Result<Map<String, Value>, ExchangeError> {
    let mut parts = id_token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(ExchangeError::InvalidIdToken("not a JWT".into())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ExchangeError::InvalidIdToken(e.to_string()))?;
    let claims: Map<String, Value> = serde_json::from_slice(&bytes)
        .map_err(|e| ExchangeError::InvalidIdToken(e.to_string()))?;

    let audience_matches = match claims.get("aud") {
        Some(Value::String(aud)) => aud == client_id,
        Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(client_id)),
        _ => false,
    };
    if !audience_matches {
        return Err(ExchangeError::InvalidIdToken("audience mismatch".into()));
    }

    if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
        if exp + ID_TOKEN_LEEWAY_SECS < now {
            return Err(ExchangeError::InvalidIdToken("token expired".into()));
        }
    }

    Ok(claims)
}

/// Build an unsigned id token carrying `claims`.
#[cfg(test)]
pub(crate) fn fake_id_token(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
