//! Pre-issued JWT authentication
//!
//! The client sends one HS256 token verbatim on every authenticated message.
//! The server pins the algorithm to HS256 so a token signed with any other
//! algorithm is refused before its claims are looked at.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, errors::ErrorKind};
use serde::Deserialize;

use crate::config::{JwtClientConfig, JwtServerConfig};
use crate::{Error, Result};

/// Client side: holds the pre-issued token
pub struct JwtAuth {
    token: String,
}

impl JwtAuth {
    /// Create from config; the token must be present
    pub fn new(config: &JwtClientConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(Error::Config("jwt.token must be set".to_string()));
        }
        Ok(Self {
            token: config.token.clone(),
        })
    }

    /// The token, reused verbatim as privilege key
    #[must_use]
    pub fn privilege_key(&self) -> &str {
        &self.token
    }
}

/// Claims looked at by the verifier
#[derive(Debug, Clone, Deserialize)]
pub struct JwtClaims {
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Preferred identity claim
    #[serde(default)]
    pub email: Option<String>,
    /// Fallback identity claim; may be a string or a number
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    /// Expiry (Unix timestamp)
    pub exp: u64,
}

impl JwtClaims {
    /// `email`, falling back to `id`
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        if let Some(email) = self.email.as_deref().filter(|e| !e.is_empty()) {
            return Some(email.to_string());
        }
        match self.id.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Server side: HS256 verification with the shared secret
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create from config; the secret must be present
    pub fn new(config: &JwtServerConfig) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(Error::Config("jwt.secret must be set".to_string()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;

        Ok(Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        })
    }

    /// Check signature and expiry only
    pub fn verify(&self, token: &str) -> Result<JwtClaims> {
        jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Check the token and, when `user` is non-empty, that it belongs to `user`
    pub fn verify_login(&self, token: &str, user: &str) -> Result<()> {
        let claims = self.verify(token)?;
        if user.is_empty() {
            return Ok(());
        }

        match claims.identity() {
            Some(identity) if identity == user => Ok(()),
            Some(identity) => Err(Error::CredentialInvalid(format!(
                "token identity {identity} does not match user {user}"
            ))),
            None => Err(Error::CredentialInvalid(
                "token carries neither email nor id claim".to_string(),
            )),
        }
    }
}

/// Map a jsonwebtoken failure onto the crate taxonomy
pub(crate) fn map_jwt_error(err: jsonwebtoken::errors::Error) -> Error {
    match err.kind() {
        ErrorKind::ExpiredSignature => Error::CredentialExpired,
        _ => Error::CredentialInvalid(err.to_string()),
    }
}
