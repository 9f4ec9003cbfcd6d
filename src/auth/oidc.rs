//! OIDC authentication
//!
//! # Client
//!
//! [`OidcTokenSource`] runs an OAuth2 client-credentials exchange against the
//! configured token endpoint on every call and hands back the access token.
//!
//! # Server
//!
//! [`OidcVerifier`] checks the access token signature against the provider's
//! JWKS (discovered from `{issuer}/.well-known/openid-configuration` unless a
//! `jwks_uri` is configured), then issuer, expiry and audience as configured.
//! It returns the token subject.
//!
//! Subject continuity is tracked per connection by [`SubjectBinding`]:
//!
//! ```text
//! AwaitingLogin --verify_login(sub)--> Bound(sub)
//! Bound(sub): login, ping and work conn must present sub, anything else fails
//! AwaitingLogin: ping / work conn always fail
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::jwks::{JwksCache, check_audience};
use crate::config::{OidcClientConfig, OidcServerConfig};
use crate::{Error, Result};

/// Token endpoint response; only the access token is used
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// Client side: OAuth2 client-credentials exchange
pub struct OidcTokenSource {
    http_client: Client,
    config: OidcClientConfig,
}

impl OidcTokenSource {
    /// Create from config; the token endpoint must be set
    pub fn new(config: OidcClientConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build OIDC HTTP client: {e}")))?;
        Self::with_client(http_client, config)
    }

    /// Create with a caller supplied HTTP client
    pub fn with_client(http_client: Client, config: OidcClientConfig) -> Result<Self> {
        if config.token_endpoint_url.is_empty() {
            return Err(Error::Config(
                "oidc.token_endpoint_url must be set".to_string(),
            ));
        }
        Ok(Self {
            http_client,
            config,
        })
    }

    /// Run the client-credentials exchange and return the access token
    pub async fn fetch_token(&self) -> Result<String> {
        let mut params: HashMap<&str, &str> = self
            .config
            .additional_endpoint_params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        params.insert("grant_type", "client_credentials");
        params.insert("client_id", &self.config.client_id);
        params.insert("client_secret", &self.config.client_secret);
        if !self.config.audience.is_empty() {
            params.insert("audience", &self.config.audience);
        }
        if !self.config.scope.is_empty() {
            params.insert("scope", &self.config.scope);
        }

        debug!(endpoint = %self.config.token_endpoint_url, "Requesting OIDC access token");

        let response = self
            .http_client
            .post(&self.config.token_endpoint_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("malformed token response: {e}")))?;

        if token.access_token.is_empty() {
            return Err(Error::Transport(
                "token endpoint returned an empty access token".to_string(),
            ));
        }
        Ok(token.access_token)
    }
}

/// Subject bound to one control connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubjectBinding {
    /// No successful login yet
    #[default]
    AwaitingLogin,
    /// Subject recorded by the last successful login
    Bound(String),
}

impl SubjectBinding {
    /// Fail unless a login has been verified
    pub fn require_bound(&self) -> Result<&str> {
        match self {
            Self::Bound(subject) => Ok(subject),
            Self::AwaitingLogin => Err(Error::SessionContinuity(
                "no OIDC subject bound, login has not been verified on this connection"
                    .to_string(),
            )),
        }
    }

    /// Fail unless `subject` equals the bound subject
    pub fn check(&self, subject: &str) -> Result<()> {
        let bound = self.require_bound()?;
        if bound == subject {
            Ok(())
        } else {
            Err(Error::SessionContinuity(format!(
                "received different OIDC subject in login and ping. original subject: {bound}, new subject: {subject}"
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    aud: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    jwks_uri: String,
}

/// Server side: OIDC access token verification
pub struct OidcVerifier {
    config: OidcServerConfig,
    jwks: Arc<JwksCache>,
    jwks_uri: RwLock<Option<String>>,
}

impl OidcVerifier {
    /// Create with a private HTTPS-only JWKS cache
    pub fn new(config: OidcServerConfig) -> Result<Self> {
        Self::with_cache(config, Arc::new(JwksCache::new()?))
    }

    /// Create sharing an existing JWKS cache
    pub fn with_cache(config: OidcServerConfig, jwks: Arc<JwksCache>) -> Result<Self> {
        if config.issuer.is_empty() && config.jwks_uri.is_none() {
            return Err(Error::Config(
                "oidc.issuer or oidc.jwks_uri must be set".to_string(),
            ));
        }
        if config.issuer.is_empty() && !config.skip_issuer_check {
            return Err(Error::Config(
                "oidc.issuer must be set unless oidc.skip_issuer_check is enabled".to_string(),
            ));
        }
        let jwks_uri = RwLock::new(config.jwks_uri.clone());
        Ok(Self {
            config,
            jwks,
            jwks_uri,
        })
    }

    /// Verify an access token and return its subject
    pub async fn verify(&self, token: &str) -> Result<String> {
        let jwks_uri = self.jwks_uri().await?;
        let config = &self.config;

        let data = self
            .jwks
            .decode::<AccessTokenClaims>(token, &jwks_uri, |v| {
                if config.skip_expiry_check {
                    v.validate_exp = false;
                    v.required_spec_claims.remove("exp");
                }
                if !config.skip_issuer_check && !config.issuer.is_empty() {
                    v.set_issuer(&[config.issuer.as_str()]);
                }
                // Audience is checked below to accept both string and array forms
                v.validate_aud = false;
            })
            .await?;

        if !config.audience.is_empty() {
            check_audience(&data.claims.aud, &config.audience)?;
        }

        let subject = data.claims.sub;
        if subject.is_empty() {
            return Err(Error::CredentialInvalid(
                "token carries no subject".to_string(),
            ));
        }
        Ok(subject)
    }

    async fn jwks_uri(&self) -> Result<String> {
        let cached = self.jwks_uri.read().clone();
        if let Some(uri) = cached {
            return Ok(uri);
        }

        let discovery = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer.trim_end_matches('/')
        );
        debug!(url = %discovery, "Discovering OIDC provider metadata");

        let response = self
            .jwks
            .http()
            .get(&discovery)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("OIDC discovery failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "OIDC discovery returned: {status}"
            )));
        }
        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("malformed provider metadata: {e}")))?;

        *self.jwks_uri.write() = Some(metadata.jwks_uri.clone());
        Ok(metadata.jwks_uri)
    }
}
