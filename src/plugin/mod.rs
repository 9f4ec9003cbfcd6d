//! Server plugin contract
//!
//! External policy services observe, veto or rewrite control operations.
//! Every operation has one static content type; [`Content`] is the closed sum
//! of them, and [`OpContent`] maps each concrete type back to its
//! [`Operation`], so plugin replies are decoded against a known schema
//! instead of whatever type happened to be passed in.

pub mod http;
pub mod manager;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::msg::{CloseProxy, Login, NewProxy, NewWorkConn, Ping};
use crate::Result;

pub use http::HttpPlugin;
pub use manager::Manager;

/// Version string sent with every plugin request
pub const API_VERSION: &str = "0.1.0";

/// Header carrying the per-dispatch request ID
pub const REQ_ID_HEADER: &str = "X-Frp-Reqid";

/// Control operations a plugin can take part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Client login
    Login,
    /// Proxy registration
    NewProxy,
    /// Proxy teardown (notification only)
    CloseProxy,
    /// Heartbeat
    Ping,
    /// Work connection setup
    NewWorkConn,
    /// Incoming user connection on a proxy
    NewUserConn,
}

impl Operation {
    /// Every operation, in declaration order
    pub const ALL: [Self; 6] = [
        Self::Login,
        Self::NewProxy,
        Self::CloseProxy,
        Self::Ping,
        Self::NewWorkConn,
        Self::NewUserConn,
    ];

    /// Wire name of the operation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "Login",
            Self::NewProxy => "NewProxy",
            Self::CloseProxy => "CloseProxy",
            Self::Ping => "Ping",
            Self::NewWorkConn => "NewWorkConn",
            Self::NewUserConn => "NewUserConn",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the client an operation belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    /// User from the login
    pub user: String,
    /// Client metadata from the login
    #[serde(deserialize_with = "crate::msg::null_as_default")]
    pub metas: HashMap<String, String>,
    /// Run ID of the control connection
    pub run_id: String,
}

/// Login content: the login message plus the peer address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginContent {
    /// Login message
    #[serde(flatten)]
    pub login: Login,
    /// Remote address of the control connection
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_address: String,
}

impl LoginContent {
    /// Identity carried by the login itself
    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            user: self.login.user.clone(),
            metas: self.login.metas.clone(),
            run_id: self.login.run_id.clone(),
        }
    }
}

/// Proxy registration content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxyContent {
    /// Owning client
    pub user: UserInfo,
    /// Registration message
    #[serde(flatten)]
    pub new_proxy: NewProxy,
}

/// Proxy teardown content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseProxyContent {
    /// Owning client
    pub user: UserInfo,
    /// Teardown message
    #[serde(flatten)]
    pub close_proxy: CloseProxy,
}

/// Heartbeat content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingContent {
    /// Owning client
    pub user: UserInfo,
    /// Heartbeat message
    #[serde(flatten)]
    pub ping: Ping,
}

/// Work connection content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkConnContent {
    /// Owning client
    pub user: UserInfo,
    /// Work connection message
    #[serde(flatten)]
    pub new_work_conn: NewWorkConn,
}

/// Incoming user connection content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUserConnContent {
    /// Client owning the proxy
    pub user: UserInfo,
    /// Proxy receiving the connection
    pub proxy_name: String,
    /// Type of that proxy
    pub proxy_type: String,
    /// Address of the connecting user
    pub remote_addr: String,
}

/// Content of any operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Content {
    /// [`Operation::Login`]
    Login(LoginContent),
    /// [`Operation::NewProxy`]
    NewProxy(NewProxyContent),
    /// [`Operation::CloseProxy`]
    CloseProxy(CloseProxyContent),
    /// [`Operation::Ping`]
    Ping(PingContent),
    /// [`Operation::NewWorkConn`]
    NewWorkConn(NewWorkConnContent),
    /// [`Operation::NewUserConn`]
    NewUserConn(NewUserConnContent),
}

impl Content {
    /// Operation this content belongs to
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Login(_) => Operation::Login,
            Self::NewProxy(_) => Operation::NewProxy,
            Self::CloseProxy(_) => Operation::CloseProxy,
            Self::Ping(_) => Operation::Ping,
            Self::NewWorkConn(_) => Operation::NewWorkConn,
            Self::NewUserConn(_) => Operation::NewUserConn,
        }
    }

    /// Decode JSON against the content type registered for `op`
    pub fn decode(op: Operation, value: serde_json::Value) -> Result<Self> {
        Ok(match op {
            Operation::Login => Self::Login(serde_json::from_value(value)?),
            Operation::NewProxy => Self::NewProxy(serde_json::from_value(value)?),
            Operation::CloseProxy => Self::CloseProxy(serde_json::from_value(value)?),
            Operation::Ping => Self::Ping(serde_json::from_value(value)?),
            Operation::NewWorkConn => Self::NewWorkConn(serde_json::from_value(value)?),
            Operation::NewUserConn => Self::NewUserConn(serde_json::from_value(value)?),
        })
    }

    /// Identity of the client the operation belongs to
    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        match self {
            Self::Login(c) => c.user_info(),
            Self::NewProxy(c) => c.user.clone(),
            Self::CloseProxy(c) => c.user.clone(),
            Self::Ping(c) => c.user.clone(),
            Self::NewWorkConn(c) => c.user.clone(),
            Self::NewUserConn(c) => c.user.clone(),
        }
    }
}

/// A concrete content type and the operation it belongs to
pub trait OpContent: Sized + Send {
    /// Operation carrying this content
    const OP: Operation;

    /// Wrap into the sum type
    fn into_content(self) -> Content;

    /// Unwrap from the sum type; `None` for another operation's content
    fn from_content(content: Content) -> Option<Self>;
}

macro_rules! op_content {
    ($ty:ty, $variant:ident) => {
        impl OpContent for $ty {
            const OP: Operation = Operation::$variant;

            fn into_content(self) -> Content {
                Content::$variant(self)
            }

            fn from_content(content: Content) -> Option<Self> {
                match content {
                    Content::$variant(c) => Some(c),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Content {
            fn from(c: $ty) -> Self {
                Content::$variant(c)
            }
        }
    };
}

op_content!(LoginContent, Login);
op_content!(NewProxyContent, NewProxy);
op_content!(CloseProxyContent, CloseProxy);
op_content!(PingContent, Ping);
op_content!(NewWorkConnContent, NewWorkConn);
op_content!(NewUserConnContent, NewUserConn);

/// Request body sent to a plugin
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    /// Plugin API version
    pub version: &'a str,
    /// Operation
    pub op: Operation,
    /// Operation content
    pub content: &'a Content,
}

/// Plugin decision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Veto the operation
    pub reject: bool,
    /// Reason surfaced to the operator when rejecting
    pub reject_reason: String,
    /// Keep the content as it was sent
    pub unchange: bool,
    /// Replacement content when neither rejecting nor unchanged
    pub content: Option<Content>,
}

impl Response {
    /// Veto with `reason`
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            reject: true,
            reject_reason: reason.into(),
            ..Default::default()
        }
    }

    /// Allow without changes
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            unchange: true,
            ..Default::default()
        }
    }

    /// Allow with rewritten content
    #[must_use]
    pub fn replace(content: impl Into<Content>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// Per-dispatch context handed to every plugin in the chain
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Request ID shared by every plugin call of one dispatch
    pub req_id: String,
}

impl PluginContext {
    /// Context with a fresh request ID
    #[must_use]
    pub fn new() -> Self {
        Self {
            req_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

impl Default for PluginContext {
    fn default() -> Self {
        Self::new()
    }
}

/// An external policy service
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Whether the plugin takes part in `op`
    fn is_support(&self, op: Operation) -> bool;

    /// Ask the plugin about `content`
    ///
    /// An `Err` means no decision was obtained (unreachable, bad status,
    /// malformed reply); a veto is an `Ok` response with `reject` set.
    async fn handle(&self, ctx: &PluginContext, op: Operation, content: &Content)
    -> Result<Response>;
}
