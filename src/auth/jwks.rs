//! JWKS fetching, caching and RS/ES/PS token decoding
//!
//! Shared by the OIDC and Entra ID verifiers.
//!
//! - One cache entry per JWKS URL, reused until its TTL elapses.
//! - An unknown `kid` triggers a single forced refresh before failing, so a
//!   key rotation at the provider is picked up without hammering it when the
//!   key truly does not exist.
//! - Only asymmetric algorithms are accepted. A JWKS verifier never checks an
//!   HMAC signature, which would let a public key double as a shared secret.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::jwt::map_jwt_error;
use crate::{Error, Result};

/// Default time a fetched JWKS is reused
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(3600);

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// JWKS cache, keyed by JWKS URL
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// HTTPS-only cache with the default TTL
    pub fn new() -> Result<Self> {
        Self::with_ttl(DEFAULT_JWKS_TTL)
    }

    /// HTTPS-only cache with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(true)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build JWKS HTTP client: {e}")))?;
        Ok(Self::with_client(http, ttl))
    }

    /// Cache using a caller supplied client (e.g. one allowing plain HTTP)
    #[must_use]
    pub fn with_client(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            http,
            ttl,
        }
    }

    /// Seed the cache with a key set, as if it had just been fetched
    pub fn insert(&self, jwks_uri: &str, keys: JwkSet) {
        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys,
                fetched_at: Instant::now(),
                ttl: self.ttl,
            },
        );
    }

    /// HTTP client used for fetches; verifiers reuse it for discovery
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Return the cached JWKS for `jwks_uri`, fetching it if absent or stale.
    ///
    /// If `force_refresh` is `true`, the cache is bypassed regardless of TTL.
    pub async fn get_or_fetch(&self, jwks_uri: &str, force_refresh: bool) -> Result<JwkSet> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(jwks_uri) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(jwks_uri = %jwks_uri, "Fetching JWKS");
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("JWKS fetch failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("JWKS endpoint returned: {status}")));
        }
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("malformed JWKS: {e}")))?;

        self.insert(jwks_uri, jwks.clone());
        Ok(jwks)
    }

    /// Find a decoding key by `kid`, refreshing the cache once if not found.
    pub async fn find_decoding_key(&self, jwks_uri: &str, kid: &str) -> Result<DecodingKey> {
        let jwks = self.get_or_fetch(jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.get_or_fetch(jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid)
            .ok_or_else(|| Error::CredentialInvalid(format!("unknown key ID: {kid}")))
    }

    /// Verify the signature of `token` against the key set at `jwks_uri`.
    ///
    /// `configure` receives a validation already pinned to the header
    /// algorithm and adjusts the claim checks.
    pub async fn decode<T: DeserializeOwned>(
        &self,
        token: &str,
        jwks_uri: &str,
        configure: impl FnOnce(&mut Validation),
    ) -> Result<TokenData<T>> {
        let header = jsonwebtoken::decode_header(token).map_err(map_jwt_error)?;
        let alg = asymmetric(header.alg)?;
        let kid = header
            .kid
            .ok_or_else(|| Error::CredentialInvalid("JWT missing 'kid' field in header".to_string()))?;

        let key = self.find_decoding_key(jwks_uri, &kid).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = 60;
        configure(&mut validation);

        jsonwebtoken::decode::<T>(token, &key, &validation).map_err(map_jwt_error)
    }
}

fn asymmetric(alg: Algorithm) -> Result<Algorithm> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        other => Err(Error::CredentialInvalid(format!(
            "unsupported JWT algorithm: {other:?}"
        ))),
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

/// Validate that the token's `aud` claim contains the expected audience.
pub(crate) fn check_audience(aud_claim: &serde_json::Value, expected: &str) -> Result<()> {
    let matches = match aud_claim {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(Error::CredentialInvalid(format!(
            "audience {expected} not present in token"
        )))
    }
}
