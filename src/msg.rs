//! Control-channel messages
//!
//! These structs are owned by the transport layer; the pipeline only reads and
//! writes their fields. JSON field names match the wire format so the same
//! structs can be embedded in plugin request content.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Client login, always the first message on a control connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    /// Client version string
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Client hostname
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Client operating system
    pub os: String,
    /// Client architecture
    pub arch: String,
    /// Claimed user
    pub user: String,
    /// Method-specific proof
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    /// Run ID, empty on first login and reused on reconnect
    pub run_id: String,
    /// Free-form client metadata
    #[serde(deserialize_with = "null_as_default")]
    pub metas: HashMap<String, String>,
    /// Number of work connections the client pre-opens
    pub pool_count: u32,
}

/// Heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    /// Method-specific proof (only set when the heartbeat scope is enabled)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

/// Work connection announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkConn {
    /// Run ID of the owning control connection
    pub run_id: String,
    /// Method-specific proof (only set when the work-connection scope is enabled)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

/// Proxy registration request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxy {
    /// Unique proxy name within the client
    pub proxy_name: String,
    /// tcp, udp, http, https, stcp, sudp, xtcp, ...
    pub proxy_type: String,
    /// Encrypt the data plane
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_encryption: bool,
    /// Compress the data plane
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_compression: bool,
    /// Bandwidth limit such as `1MB`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bandwidth_limit: String,
    /// Load-balancing group
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// Load-balancing group secret
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group_key: String,
    /// Free-form proxy metadata
    #[serde(skip_serializing_if = "HashMap::is_empty", deserialize_with = "null_as_default")]
    pub metas: HashMap<String, String>,

    // tcp and udp only
    /// Requested server port
    #[serde(skip_serializing_if = "is_zero")]
    pub remote_port: u16,

    // http and https only
    /// Custom domains routed to this proxy
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub custom_domains: Vec<String>,
    /// Subdomain under the server's root domain
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
    /// URL path prefixes
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub locations: Vec<String>,
    /// Basic-auth user
    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_user: String,
    /// Basic-auth password
    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_pwd: String,
    /// Host header sent upstream
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_header_rewrite: String,
    /// Extra request headers
    #[serde(skip_serializing_if = "HashMap::is_empty", deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,

    // stcp, sudp and xtcp only
    /// Visitor secret key
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sk: String,
    /// Users allowed to visit
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub allow_users: Vec<String>,
}

/// Proxy teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseProxy {
    /// Name of the proxy being closed
    pub proxy_name: String,
}

/// Decode `null` as the empty value; Go peers encode nil maps and slices that way
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(port: &u16) -> bool {
    *port == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn login_uses_wire_field_names() {
        let login = Login {
            user: "alice".to_string(),
            privilege_key: "k".to_string(),
            timestamp: 42,
            ..Default::default()
        };

        let value = serde_json::to_value(&login).unwrap();
        assert_eq!(value["user"], "alice");
        assert_eq!(value["privilege_key"], "k");
        assert_eq!(value["timestamp"], 42);
        assert!(value.get("version").is_none());
    }

    #[test]
    fn new_proxy_omits_empty_optional_fields() {
        let proxy = NewProxy {
            proxy_name: "ssh".to_string(),
            proxy_type: "tcp".to_string(),
            remote_port: 6000,
            ..Default::default()
        };

        let value = serde_json::to_value(&proxy).unwrap();
        assert_eq!(
            value,
            json!({"proxy_name": "ssh", "proxy_type": "tcp", "remote_port": 6000})
        );
    }

    #[test]
    fn null_collections_decode_as_empty() {
        // GIVEN: nil maps and slices as a Go peer encodes them
        let value = json!({
            "proxy_name": "web",
            "proxy_type": "http",
            "metas": null,
            "custom_domains": null,
            "locations": null,
            "headers": null,
            "allow_users": null
        });

        // WHEN
        let proxy: NewProxy = serde_json::from_value(value).unwrap();

        // THEN
        assert!(proxy.metas.is_empty());
        assert!(proxy.custom_domains.is_empty());
        assert!(proxy.allow_users.is_empty());

        let login: Login = serde_json::from_value(json!({"user": "alice", "metas": null})).unwrap();
        assert_eq!(login.user, "alice");
        assert!(login.metas.is_empty());
    }
}
