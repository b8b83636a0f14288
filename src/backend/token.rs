//! OAuth2 access tokens for a service account (JWT bearer grant).

use crate::error::BridgeError;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

struct CachedToken {
    value: SecretString,
    expires_at: Instant,
}

/// Mints and caches access tokens for one service account.
pub struct TokenSource {
    client_email: String,
    token_uri: String,
    signing_key: EncodingKey,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl TokenSource {
    /// Parse the PEM private key. The key text itself is not kept.
    pub fn new(
        client_email: String,
        private_key: &SecretString,
        token_uri: String,
        http: Client,
    ) -> Result<Self, BridgeError> {
        let signing_key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())
            .map_err(|e| BridgeError::Auth {
                message: format!("invalid private key: {}", e),
            })?;

        Ok(Self {
            client_email,
            token_uri,
            signing_key,
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// A valid bearer token, exchanging a fresh assertion when needed.
    pub async fn access_token(&self) -> Result<SecretString, BridgeError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + EXPIRY_MARGIN
        {
            return Ok(clone_secret(&token.value));
        }

        let fresh = self.exchange().await?;
        let value = clone_secret(&fresh.value);
        *cached = Some(fresh);
        Ok(value)
    }

    fn assertion(&self) -> Result<String, BridgeError> {
        let iat = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: BIGQUERY_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key).map_err(
            |e| BridgeError::upstream(format!("failed to sign token assertion: {}", e)),
        )
    }

    async fn exchange(&self) -> Result<CachedToken, BridgeError> {
        let assertion = self.assertion()?;
        let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];

        let resp = self
            .http
            .post(&self.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| BridgeError::upstream(format!("token request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<TokenErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error_description.or(e.error))
                .unwrap_or_else(|| format!("token endpoint returned HTTP {}", status.as_u16()));
            return Err(BridgeError::Upstream { message });
        }

        let token: TokenResponse = resp.json().await.map_err(|e| {
            BridgeError::upstream(format!("failed to parse token response: {}", e))
        })?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        Ok(CachedToken {
            value: SecretString::from(token.access_token),
            expires_at: Instant::now() + lifetime,
        })
    }
}

fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}
