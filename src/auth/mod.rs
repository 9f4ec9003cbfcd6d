//! Pluggable control-channel authentication
//!
//! Two halves, each a closed set of four methods selected once from config:
//!
//! - [`AuthSetter`] (client) attaches proof to outgoing `Login`, `Ping` and
//!   `NewWorkConn` messages.
//! - [`AuthVerifier`] (server) checks that proof. The verifier itself is
//!   stateless and shared by every connection; per-connection state lives in
//!   the [`VerifierSession`] obtained from [`AuthVerifier::session`].
//!
//! Login always carries proof. `Ping` and `NewWorkConn` carry it only when the
//! matching [`AuthScope`] is enabled; otherwise both sides treat them as
//! no-ops.

pub mod entra_id;
pub mod jwks;
pub mod jwt;
pub mod oidc;
pub mod token;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::{ClientAuthConfig, ServerAuthConfig};
use crate::msg::{Login, NewWorkConn, Ping};
use crate::{Error, Result};

pub use entra_id::{EntraIdVerifier, ManagedIdentityTokenSource};
pub use jwks::JwksCache;
pub use jwt::{JwtAuth, JwtVerifier};
pub use oidc::{OidcTokenSource, OidcVerifier, SubjectBinding};
pub use token::TokenAuth;

/// Authentication method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Shared secret keyed derivation
    #[default]
    Token,
    /// Pre-issued HS256 JWT
    Jwt,
    /// OAuth2 client credentials / OIDC
    Oidc,
    /// Azure Entra ID managed identity
    #[serde(alias = "entraid")]
    EntraId,
}

impl AuthMethod {
    /// Config spelling of the method
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Jwt => "jwt",
            Self::Oidc => "oidc",
            Self::EntraId => "entra_id",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "token" => Ok(Self::Token),
            "jwt" => Ok(Self::Jwt),
            "oidc" => Ok(Self::Oidc),
            "entra_id" | "entraid" => Ok(Self::EntraId),
            other => Err(Error::Config(format!(
                "unknown authentication method: {other}"
            ))),
        }
    }
}

/// Message types that must carry proof in addition to login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScope {
    /// `Ping` messages
    #[serde(alias = "HeartBeats")]
    HeartBeats,
    /// `NewWorkConn` messages
    #[serde(alias = "NewWorkConns")]
    NewWorkConns,
}

/// Resolved set of enabled scopes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scopes {
    heart_beats: bool,
    new_work_conns: bool,
}

impl Scopes {
    /// Build from the configured list; duplicates are harmless
    #[must_use]
    pub fn from_list(scopes: &[AuthScope]) -> Self {
        Self {
            heart_beats: scopes.contains(&AuthScope::HeartBeats),
            new_work_conns: scopes.contains(&AuthScope::NewWorkConns),
        }
    }

    /// Whether `Ping` must carry proof
    #[must_use]
    pub fn heart_beats(self) -> bool {
        self.heart_beats
    }

    /// Whether `NewWorkConn` must carry proof
    #[must_use]
    pub fn new_work_conns(self) -> bool {
        self.new_work_conns
    }
}

/// Client side proof source, one variant per [`AuthMethod`]
pub enum Credential {
    /// Keyed derivation of the shared secret and the message timestamp
    Token(TokenAuth),
    /// Pre-issued JWT
    Jwt(JwtAuth),
    /// Access token from an OAuth2 client-credentials exchange
    Oidc(OidcTokenSource),
    /// Access token from the platform managed identity
    EntraId(ManagedIdentityTokenSource),
}

impl Credential {
    /// Produce the privilege key for a message stamped with `timestamp`
    pub async fn privilege_key(&self, timestamp: i64) -> Result<String> {
        match self {
            Self::Token(t) => t.privilege_key(timestamp),
            Self::Jwt(j) => Ok(j.privilege_key().to_string()),
            Self::Oidc(o) => o.fetch_token().await,
            Self::EntraId(e) => e.fetch_token().await,
        }
    }

    fn method(&self) -> AuthMethod {
        match self {
            Self::Token(_) => AuthMethod::Token,
            Self::Jwt(_) => AuthMethod::Jwt,
            Self::Oidc(_) => AuthMethod::Oidc,
            Self::EntraId(_) => AuthMethod::EntraId,
        }
    }
}

/// Client side: attaches proof to outgoing control messages
pub struct AuthSetter {
    scopes: Scopes,
    credential: Credential,
}

impl AuthSetter {
    /// Select the implementation configured in `config.method`
    pub fn new(config: &ClientAuthConfig) -> Result<Self> {
        let credential = match config.method {
            AuthMethod::Token => Credential::Token(TokenAuth::new(&config.token)),
            AuthMethod::Jwt => Credential::Jwt(JwtAuth::new(&config.jwt)?),
            AuthMethod::Oidc => Credential::Oidc(OidcTokenSource::new(config.oidc.clone())?),
            AuthMethod::EntraId => {
                Credential::EntraId(ManagedIdentityTokenSource::new(config.entra_id.clone())?)
            }
        };
        Ok(Self::with_credential(&config.additional_scopes, credential))
    }

    /// Build from an already constructed credential
    #[must_use]
    pub fn with_credential(scopes: &[AuthScope], credential: Credential) -> Self {
        Self {
            scopes: Scopes::from_list(scopes),
            credential,
        }
    }

    /// Method in use
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        self.credential.method()
    }

    /// Attach proof to a login; always required
    pub async fn set_login(&self, login: &mut Login) -> Result<()> {
        login.timestamp = unix_now();
        login.privilege_key = self.credential.privilege_key(login.timestamp).await?;
        trace!(method = %self.method(), "login credential attached");
        Ok(())
    }

    /// Attach proof to a heartbeat when the heartbeat scope is enabled
    pub async fn set_ping(&self, ping: &mut Ping) -> Result<()> {
        if !self.scopes.heart_beats() {
            return Ok(());
        }
        ping.timestamp = unix_now();
        ping.privilege_key = self.credential.privilege_key(ping.timestamp).await?;
        Ok(())
    }

    /// Attach proof to a work connection when the work-connection scope is enabled
    pub async fn set_new_work_conn(&self, msg: &mut NewWorkConn) -> Result<()> {
        if !self.scopes.new_work_conns() {
            return Ok(());
        }
        msg.timestamp = unix_now();
        msg.privilege_key = self.credential.privilege_key(msg.timestamp).await?;
        Ok(())
    }
}

/// Server side checker, one variant per [`AuthMethod`]
pub enum Check {
    /// Recompute the keyed derivation and compare
    Token(TokenAuth),
    /// HS256 signature, expiry and login identity
    Jwt(JwtVerifier),
    /// JWKS signature, issuer, expiry and subject continuity
    Oidc(OidcVerifier),
    /// JWKS signature, audience, tenant and issuer
    EntraId(EntraIdVerifier),
}

impl Check {
    fn method(&self) -> AuthMethod {
        match self {
            Self::Token(_) => AuthMethod::Token,
            Self::Jwt(_) => AuthMethod::Jwt,
            Self::Oidc(_) => AuthMethod::Oidc,
            Self::EntraId(_) => AuthMethod::EntraId,
        }
    }
}

/// Server side: validates proof on incoming control messages
///
/// Shared by all connections. Call [`session`](Self::session) once per
/// accepted control connection.
pub struct AuthVerifier {
    scopes: Scopes,
    check: Check,
}

impl AuthVerifier {
    /// Select the implementation configured in `config.method`
    pub fn new(config: &ServerAuthConfig) -> Result<Self> {
        let check = match config.method {
            AuthMethod::Token => Check::Token(TokenAuth::new(&config.token)),
            AuthMethod::Jwt => Check::Jwt(JwtVerifier::new(&config.jwt)?),
            AuthMethod::Oidc => Check::Oidc(OidcVerifier::new(config.oidc.clone())?),
            AuthMethod::EntraId => Check::EntraId(EntraIdVerifier::new(config.entra_id.clone())?),
        };
        Ok(Self::with_check(&config.additional_scopes, check))
    }

    /// Build from an already constructed checker
    #[must_use]
    pub fn with_check(scopes: &[AuthScope], check: Check) -> Self {
        Self {
            scopes: Scopes::from_list(scopes),
            check,
        }
    }

    /// Method in use
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        self.check.method()
    }

    /// Start verification state for one control connection
    #[must_use]
    pub fn session(self: &Arc<Self>) -> VerifierSession {
        VerifierSession {
            verifier: Arc::clone(self),
            binding: SubjectBinding::AwaitingLogin,
        }
    }
}

/// Verification state of a single control connection
///
/// Owned by the connection and dropped with it; never share one session
/// between connections.
pub struct VerifierSession {
    verifier: Arc<AuthVerifier>,
    binding: SubjectBinding,
}

impl VerifierSession {
    /// Subject bound by the first successful OIDC login
    #[must_use]
    pub fn binding(&self) -> &SubjectBinding {
        &self.binding
    }

    /// Verify a login. Always checked regardless of scopes.
    pub async fn verify_login(&mut self, login: &Login) -> Result<()> {
        match &self.verifier.check {
            Check::Token(t) => t.verify(login.timestamp, &login.privilege_key),
            Check::Jwt(j) => j.verify_login(&login.privilege_key, &login.user),
            Check::Oidc(o) => {
                let subject = o.verify(&login.privilege_key).await?;
                if let SubjectBinding::Bound(_) = &self.binding {
                    // A repeated login may not switch identities
                    return self.binding.check(&subject);
                }
                debug!(subject = %subject, "OIDC session bound");
                self.binding = SubjectBinding::Bound(subject);
                Ok(())
            }
            Check::EntraId(e) => e.verify(&login.privilege_key).await.map(|_| ()),
        }
    }

    /// Verify a heartbeat when the heartbeat scope is enabled
    pub async fn verify_ping(&self, ping: &Ping) -> Result<()> {
        if !self.verifier.scopes.heart_beats() {
            return Ok(());
        }
        self.verify_follow_up(ping.timestamp, &ping.privilege_key).await
    }

    /// Verify a work connection when the work-connection scope is enabled
    pub async fn verify_new_work_conn(&self, msg: &NewWorkConn) -> Result<()> {
        if !self.verifier.scopes.new_work_conns() {
            return Ok(());
        }
        self.verify_follow_up(msg.timestamp, &msg.privilege_key).await
    }

    async fn verify_follow_up(&self, timestamp: i64, privilege_key: &str) -> Result<()> {
        match &self.verifier.check {
            Check::Token(t) => t.verify(timestamp, privilege_key),
            Check::Jwt(j) => j.verify(privilege_key).map(|_| ()),
            Check::Oidc(o) => {
                // Fail before any network I/O when there is nothing to compare against
                self.binding.require_bound()?;
                let subject = o.verify(privilege_key).await?;
                self.binding.check(&subject)
            }
            Check::EntraId(e) => e.verify(privilege_key).await.map(|_| ()),
        }
    }
}

/// Seconds since the Unix epoch
pub(crate) fn unix_now() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}
