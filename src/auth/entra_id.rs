//! Azure Entra ID authentication
//!
//! The client obtains an access token for the configured audience from the
//! platform managed identity (instance metadata service by default). The
//! server validates it against the tenant JWKS and checks audience, tenant and
//! issuer. Entra issues v1 and v2 tokens with different issuer formats; both
//! are accepted:
//!
//! - `https://sts.windows.net/{tenant}/`
//! - `https://login.microsoftonline.com/{tenant}/v2.0`

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::jwks::{JwksCache, check_audience};
use super::unix_now;
use crate::config::{EntraIdClientConfig, EntraIdServerConfig};
use crate::{Error, Result};

/// Instance metadata service token endpoint
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";

/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct ManagedIdentityResponse {
    access_token: String,
    /// Unix timestamp; IMDS sends it as a string
    #[serde(default)]
    expires_on: serde_json::Value,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_on: i64,
}

/// Client side: managed-identity access token, cached until close to expiry
pub struct ManagedIdentityTokenSource {
    http_client: Client,
    config: EntraIdClientConfig,
    current_token: RwLock<Option<CachedToken>>,
}

impl ManagedIdentityTokenSource {
    /// Create from config; the audience must be set
    pub fn new(config: EntraIdClientConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build managed identity client: {e}")))?;
        Self::with_client(http_client, config)
    }

    /// Create with a caller supplied HTTP client
    pub fn with_client(http_client: Client, config: EntraIdClientConfig) -> Result<Self> {
        if config.audience.is_empty() {
            return Err(Error::Config("entra_id.audience must be set".to_string()));
        }
        Ok(Self {
            http_client,
            config,
            current_token: RwLock::new(None),
        })
    }

    /// Return a valid access token, acquiring a new one when needed
    pub async fn fetch_token(&self) -> Result<String> {
        let cached = self.current_token.read().clone();
        if let Some(token) = cached {
            if token.expires_on - REFRESH_MARGIN_SECS > unix_now() {
                return Ok(token.access_token);
            }
        }

        let token = self.acquire().await?;
        let access_token = token.access_token.clone();
        *self.current_token.write() = Some(token);
        Ok(access_token)
    }

    async fn acquire(&self) -> Result<CachedToken> {
        let endpoint = self
            .config
            .identity_endpoint
            .as_deref()
            .unwrap_or(IMDS_TOKEN_ENDPOINT);

        let mut query = vec![
            ("api-version", IMDS_API_VERSION),
            ("resource", self.config.audience.as_str()),
        ];
        if !self.config.client_id.is_empty() {
            query.push(("client_id", self.config.client_id.as_str()));
        }

        debug!(
            endpoint = %endpoint,
            tenant = %self.config.tenant_id,
            audience = %self.config.audience,
            "Requesting managed identity token"
        );

        let response = self
            .http_client
            .get(endpoint)
            .query(&query)
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| Error::Transport(format!("managed identity request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "managed identity endpoint returned {status}: {body}"
            )));
        }

        let body: ManagedIdentityResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("malformed managed identity response: {e}")))?;

        let expires_on = match &body.expires_on {
            serde_json::Value::String(s) => s.parse().unwrap_or(0),
            serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
            _ => 0,
        };

        Ok(CachedToken {
            access_token: body.access_token,
            expires_on,
        })
    }
}

/// Claims of a verified Entra ID access token
#[derive(Debug, Clone, Deserialize)]
pub struct EntraIdClaims {
    /// Issuer
    pub iss: String,
    /// Tenant ID
    #[serde(default)]
    pub tid: String,
    /// Audience, string or array
    #[serde(default)]
    pub aud: serde_json::Value,
    /// Subject
    #[serde(default)]
    pub sub: String,
    /// Object ID of the calling identity
    #[serde(default)]
    pub oid: Option<String>,
}

/// Server side: Entra ID access token verification
pub struct EntraIdVerifier {
    config: EntraIdServerConfig,
    jwks: Arc<JwksCache>,
    jwks_uri: String,
}

impl EntraIdVerifier {
    /// Create with a private HTTPS-only JWKS cache
    pub fn new(config: EntraIdServerConfig) -> Result<Self> {
        let ttl = Duration::from_secs(config.jwks_cache_ttl_secs);
        Self::with_cache(config, Arc::new(JwksCache::with_ttl(ttl)?))
    }

    /// Create sharing an existing JWKS cache
    pub fn with_cache(config: EntraIdServerConfig, jwks: Arc<JwksCache>) -> Result<Self> {
        if config.audience.is_empty() {
            return Err(Error::Config("entra_id.audience must be set".to_string()));
        }
        let jwks_uri = config.jwks_uri.clone().unwrap_or_else(|| {
            let tenant = if config.tenant_id.is_empty() {
                "common"
            } else {
                config.tenant_id.as_str()
            };
            format!("https://login.microsoftonline.com/{tenant}/discovery/v2.0/keys")
        });
        Ok(Self {
            config,
            jwks,
            jwks_uri,
        })
    }

    /// JWKS URL the verifier reads keys from
    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Verify an access token and return its claims
    pub async fn verify(&self, token: &str) -> Result<EntraIdClaims> {
        let data = self
            .jwks
            .decode::<EntraIdClaims>(token, &self.jwks_uri, |v| {
                v.validate_aud = false;
            })
            .await?;
        let claims = data.claims;

        check_audience(&claims.aud, &self.config.audience)?;

        let enforce_tenant = !self.config.tenant_id.is_empty() && !self.config.skip_tenant_check;
        if enforce_tenant && claims.tid != self.config.tenant_id {
            return Err(Error::CredentialInvalid(format!(
                "tenant {} does not match expected tenant {}",
                claims.tid, self.config.tenant_id
            )));
        }

        let issuer_tenant = if enforce_tenant {
            self.config.tenant_id.as_str()
        } else {
            claims.tid.as_str()
        };
        if !valid_issuers(issuer_tenant).contains(&claims.iss) {
            return Err(Error::CredentialInvalid(format!(
                "unexpected issuer: {}",
                claims.iss
            )));
        }

        Ok(claims)
    }
}

/// Both accepted issuer formats for `tenant`
fn valid_issuers(tenant: &str) -> [String; 2] {
    [
        format!("https://sts.windows.net/{tenant}/"),
        format!("https://login.microsoftonline.com/{tenant}/v2.0"),
    ]
}
