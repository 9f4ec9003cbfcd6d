//! Configuration management
//!
//! Plain serde types consumed by the auth factories and the plugin manager.
//! [`ClientConfig::load`] and [`ServerConfig::load`] merge a YAML file with
//! `TUNNEL_GUARD_*` environment variables, but callers are free to build the
//! structs any other way.

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::auth::{AuthMethod, AuthScope};
use crate::plugin::Operation;
use crate::{Error, Result};

/// Environment variable prefix for config overrides
pub const ENV_PREFIX: &str = "TUNNEL_GUARD_";

/// Client side configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How the client proves its identity
    pub auth: ClientAuthConfig,
}

/// Server side configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// How the server checks client identity
    pub auth: ServerAuthConfig,
    /// External policy plugins, invoked in this order
    pub http_plugins: Vec<HttpPluginOptions>,
}

/// Client authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientAuthConfig {
    /// Authentication method
    pub method: AuthMethod,
    /// Messages that carry proof in addition to login
    pub additional_scopes: Vec<AuthScope>,
    /// Shared secret for the token method
    pub token: String,
    /// JWT method settings
    pub jwt: JwtClientConfig,
    /// OIDC method settings
    pub oidc: OidcClientConfig,
    /// Entra ID method settings
    pub entra_id: EntraIdClientConfig,
}

/// Server authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAuthConfig {
    /// Authentication method
    pub method: AuthMethod,
    /// Messages that must carry proof in addition to login
    pub additional_scopes: Vec<AuthScope>,
    /// Shared secret for the token method
    pub token: String,
    /// JWT method settings
    pub jwt: JwtServerConfig,
    /// OIDC method settings
    pub oidc: OidcServerConfig,
    /// Entra ID method settings
    pub entra_id: EntraIdServerConfig,
}

/// Pre-issued JWT presented by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtClientConfig {
    /// HS256 token, sent verbatim as the privilege key
    pub token: String,
}

/// JWT verification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtServerConfig {
    /// HS256 signing secret
    pub secret: String,
}

/// OAuth2 client-credentials settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcClientConfig {
    /// OAuth2 client ID
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: String,
    /// Requested audience (sent as an extra endpoint parameter)
    pub audience: String,
    /// Requested scope
    pub scope: String,
    /// Token endpoint of the identity provider
    pub token_endpoint_url: String,
    /// Extra form parameters sent to the token endpoint
    pub additional_endpoint_params: HashMap<String, String>,
}

/// OIDC verification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcServerConfig {
    /// Expected issuer, also the discovery base URL. Required unless
    /// `skip_issuer_check` is set.
    pub issuer: String,
    /// Expected audience; empty disables the check
    pub audience: String,
    /// Accept expired tokens
    pub skip_expiry_check: bool,
    /// Accept tokens from any issuer
    pub skip_issuer_check: bool,
    /// JWKS URL; discovered from the issuer when unset
    pub jwks_uri: Option<String>,
}

/// Managed-identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntraIdClientConfig {
    /// Directory (tenant) ID. Only logged; the managed-identity endpoint
    /// issues tokens for the tenant the identity lives in.
    pub tenant_id: String,
    /// Application ID URI the token is requested for
    pub audience: String,
    /// Client ID of a user-assigned identity; empty selects the system identity
    pub client_id: String,
    /// Managed-identity token endpoint; defaults to the instance metadata service
    pub identity_endpoint: Option<String>,
}

/// Entra ID verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntraIdServerConfig {
    /// Expected tenant ID; empty accepts any tenant
    pub tenant_id: String,
    /// Expected audience
    pub audience: String,
    /// Skip `tid` comparison even when a tenant is configured
    pub skip_tenant_check: bool,
    /// JWKS URL; derived from the tenant when unset
    pub jwks_uri: Option<String>,
    /// How long a fetched JWKS is reused
    pub jwks_cache_ttl_secs: u64,
}

impl Default for EntraIdServerConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            audience: String::new(),
            skip_tenant_check: false,
            jwks_uri: None,
            jwks_cache_ttl_secs: 3600,
        }
    }
}

/// Descriptor of one HTTP policy plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPluginOptions {
    /// Plugin name, used in logs and errors
    pub name: String,
    /// `host:port`, optionally with scheme
    pub addr: String,
    /// Request path
    pub path: String,
    /// Operations the plugin participates in
    pub ops: Vec<Operation>,
    /// Verify the server certificate for https addresses
    pub tls_verify: bool,
}

impl Default for HttpPluginOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            addr: String::new(),
            path: String::new(),
            ops: Vec::new(),
            tls_verify: true,
        }
    }
}

impl ClientConfig {
    /// Load configuration from an optional YAML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = extract(path)?;
        config.expand_env_vars();
        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        let Some(re) = env_var_pattern() else { return };
        let auth = &mut self.auth;
        for value in [
            &mut auth.token,
            &mut auth.jwt.token,
            &mut auth.oidc.client_secret,
        ] {
            *value = expand_string(&re, value);
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional YAML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = extract(path)?;
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Check plugin descriptors for obvious mistakes
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for plugin in &self.http_plugins {
            if plugin.name.is_empty() {
                return Err(Error::Config("plugin name must not be empty".to_string()));
            }
            if !seen.insert(plugin.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate plugin name: {}",
                    plugin.name
                )));
            }
            if plugin.addr.is_empty() {
                return Err(Error::Config(format!(
                    "plugin [{}]: addr must not be empty",
                    plugin.name
                )));
            }
            if plugin.ops.is_empty() {
                return Err(Error::Config(format!(
                    "plugin [{}]: ops must not be empty",
                    plugin.name
                )));
            }
        }
        Ok(())
    }

    fn expand_env_vars(&mut self) {
        let Some(re) = env_var_pattern() else { return };
        let auth = &mut self.auth;
        for value in [&mut auth.token, &mut auth.jwt.secret] {
            *value = expand_string(&re, value);
        }
    }
}

fn extract<T: DeserializeOwned>(path: Option<&Path>) -> Result<T> {
    let mut figment = Figment::new();

    if let Some(p) = path {
        if !p.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
        figment = figment.merge(Yaml::file(p));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    figment.extract().map_err(|e| Error::Config(e.to_string()))
}

/// Pattern: ${VAR} or ${VAR:-default}
fn env_var_pattern() -> Option<Regex> {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").ok()
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn server_config_loads_plugins_in_order() {
        let file = write_yaml(
            r"
auth:
  method: jwt
  additional_scopes: [heart_beats]
  jwt:
    secret: s3cret
http_plugins:
  - name: quota
    addr: 127.0.0.1:9000
    path: /handler
    ops: [Login, NewProxy]
  - name: audit
    addr: https://audit.internal
    path: /events
    ops: [CloseProxy]
    tls_verify: false
",
        );

        let config = ServerConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.auth.method, AuthMethod::Jwt);
        assert_eq!(config.auth.additional_scopes, vec![AuthScope::HeartBeats]);
        assert_eq!(config.auth.jwt.secret, "s3cret");
        assert_eq!(config.http_plugins.len(), 2);
        assert_eq!(config.http_plugins[0].name, "quota");
        assert_eq!(
            config.http_plugins[0].ops,
            vec![Operation::Login, Operation::NewProxy]
        );
        assert!(config.http_plugins[0].tls_verify);
        assert!(!config.http_plugins[1].tls_verify);
    }

    #[test]
    fn unknown_auth_method_fails_to_load() {
        let file = write_yaml("auth:\n  method: kerberos\n");

        let err = ClientConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/tunnel-guard.yaml")))
            .unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn duplicate_plugin_names_are_rejected() {
        let plugin = HttpPluginOptions {
            name: "quota".to_string(),
            addr: "127.0.0.1:9000".to_string(),
            ops: vec![Operation::Login],
            ..Default::default()
        };
        let config = ServerConfig {
            http_plugins: vec![plugin.clone(), plugin],
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn plugin_without_ops_is_rejected() {
        let config = ServerConfig {
            http_plugins: vec![HttpPluginOptions {
                name: "noop".to_string(),
                addr: "127.0.0.1:9000".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn secrets_expand_defaults() {
        let re = env_var_pattern().unwrap();

        // GIVEN: a variable that is certainly unset
        let value = expand_string(&re, "${TUNNEL_GUARD_TEST_UNSET_VAR:-fallback}");

        // THEN: the default is used
        assert_eq!(value, "fallback");
    }

    #[test]
    fn secrets_expand_from_environment() {
        let re = env_var_pattern().unwrap();
        // PATH is set in every test environment
        let path = env::var("PATH").unwrap();

        assert_eq!(expand_string(&re, "${PATH}"), path);
    }
}
