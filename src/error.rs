//! Error types for the control-channel pipeline

use thiserror::Error;

/// Result type alias for tunnel-guard
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by setters, verifiers and the plugin gateway.
///
/// None of these errors close a connection by themselves; the control-channel
/// handler that receives them decides what happens to the peer.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (unknown auth method, bad plugin descriptor, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad signature, bad claims or derivation mismatch
    #[error("Invalid credential: {0}")]
    CredentialInvalid(String),

    /// Credential was well-formed but has expired
    #[error("Credential expired")]
    CredentialExpired,

    /// OIDC subject missing or different from the one bound at login
    #[error("Session continuity violation: {0}")]
    SessionContinuity(String),

    /// Outbound call failed (unreachable, non-200, malformed reply)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A plugin vetoed the operation; the reason is surfaced verbatim
    #[error("{0}")]
    PluginRejected(String),

    /// A plugin in a gating chain failed before producing a decision
    #[error("send {op} request to plugin [{plugin}] error: {source}")]
    PluginFailed {
        /// Operation being dispatched
        op: String,
        /// Name of the failing plugin
        plugin: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Combined failures of a best-effort notification fan-out
    #[error("send {op} request to plugin errors: {}", join_plugin_errors(.errors))]
    PluginErrors {
        /// Operation being dispatched
        op: String,
        /// One entry per failing plugin, in invocation order
        errors: Vec<(String, Error)>,
    },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// True when a plugin explicitly vetoed the operation.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::PluginRejected(_))
    }

    /// True when the credential was rejected only because it expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::CredentialExpired)
    }
}

fn join_plugin_errors(errors: &[(String, Error)]) -> String {
    errors
        .iter()
        .map(|(name, err)| format!("[{name}]: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_rejected_displays_reason_verbatim() {
        let err = Error::PluginRejected("quota exceeded".to_string());
        assert_eq!(err.to_string(), "quota exceeded");
        assert!(err.is_rejection());
    }

    #[test]
    fn plugin_errors_joins_every_failure() {
        // GIVEN: two failing plugins
        let err = Error::PluginErrors {
            op: "CloseProxy".to_string(),
            errors: vec![
                ("a".to_string(), Error::Transport("connection refused".to_string())),
                ("b".to_string(), Error::Transport("status 500".to_string())),
            ],
        };

        // THEN: both are named in invocation order
        assert_eq!(
            err.to_string(),
            "send CloseProxy request to plugin errors: [a]: Transport error: connection refused; \
             [b]: Transport error: status 500"
        );
    }
}
