//! Control-channel trust pipeline for reverse-tunnel proxies
//!
//! Decides, for each lifecycle message exchanged between a tunnel client and
//! server, whether the caller is who it claims to be and whether any external
//! policy plugin wants to veto or rewrite the operation.
//!
//! # Features
//!
//! - **Pluggable authentication**: shared-secret token, HS256 JWT, OIDC client
//!   credentials with per-connection subject continuity, Azure Entra ID
//! - **Scopes**: optionally require proof on heartbeats and work connections
//! - **Plugin gateway**: ordered HTTP policy plugins per operation, reject-fast
//!   for gating operations, fan-out for `CloseProxy` notifications
//!
//! Nothing here terminates connections; every component returns an
//! [`Error`] and the caller decides the consequence.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod msg;
pub mod plugin;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
