//! Shared-secret token authentication
//!
//! Both sides derive `hex(HMAC-SHA256(token, timestamp))` and compare. The
//! secret itself never crosses the wire.

use hmac::{Hmac, KeyInit, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Stateless token method, used as both setter and verifier
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    /// Create from the shared secret
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }

    /// Derive the privilege key for `timestamp`
    pub fn privilege_key(&self, timestamp: i64) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.token.as_bytes())
            .map_err(|e| Error::Config(format!("invalid token secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check that `privilege_key` is the derivation for `timestamp`
    pub fn verify(&self, timestamp: i64, privilege_key: &str) -> Result<()> {
        let expected = self.privilege_key(timestamp)?;
        if bool::from(expected.as_bytes().ct_eq(privilege_key.as_bytes())) {
            Ok(())
        } else {
            Err(Error::CredentialInvalid(
                "token in privilege key does not match".to_string(),
            ))
        }
    }
}
