//! HTTP plugin
//!
//! `POST {addr}{path}?version=..&op=..` with a JSON body
//! `{"version", "op", "content"}` and the request ID in `X-Frp-Reqid`.
//! Anything but `200 OK` is a failure; the reply body is
//! `{"reject", "reject_reason", "unchange", "content"}`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{
    API_VERSION, Content, Operation, Plugin, PluginContext, REQ_ID_HEADER, Request, Response,
};
use crate::config::HttpPluginOptions;
use crate::{Error, Result};

/// Reply as it comes off the wire; `content` is decoded per operation afterwards
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireResponse {
    reject: bool,
    reject_reason: String,
    unchange: bool,
    content: Option<serde_json::Value>,
}

/// Plugin backed by an HTTP endpoint
pub struct HttpPlugin {
    name: String,
    url: String,
    ops: Vec<Operation>,
    client: Client,
}

impl HttpPlugin {
    /// Build from a plugin descriptor
    pub fn new(options: &HttpPluginOptions) -> Result<Self> {
        let url = plugin_url(&options.addr, &options.path);

        let mut builder = Client::builder();
        if url.starts_with("https://") {
            builder = builder.danger_accept_invalid_certs(!options.tls_verify);
        }
        let client = builder.build().map_err(|e| {
            Error::Config(format!("plugin [{}]: failed to build HTTP client: {e}", options.name))
        })?;

        Ok(Self {
            name: options.name.clone(),
            url,
            ops: options.ops.clone(),
            client,
        })
    }

    /// Endpoint the plugin posts to, without query string
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Plugin for HttpPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_support(&self, op: Operation) -> bool {
        self.ops.contains(&op)
    }

    async fn handle(
        &self,
        ctx: &PluginContext,
        op: Operation,
        content: &Content,
    ) -> Result<Response> {
        let body = Request {
            version: API_VERSION,
            op,
            content,
        };

        debug!(plugin = %self.name, url = %self.url, "Sending plugin request");

        let response = self
            .client
            .post(&self.url)
            .query(&[("version", API_VERSION), ("op", op.as_str())])
            .header(REQ_ID_HEADER, &ctx.req_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("do http request error: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Transport(format!(
                "do http request error code: {}",
                status.as_u16()
            )));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("malformed plugin response: {e}")))?;

        let content = match wire.content {
            Some(value) if !value.is_null() => Some(
                Content::decode(op, value)
                    .map_err(|e| Error::Transport(format!("malformed {op} content: {e}")))?,
            ),
            _ => None,
        };

        Ok(Response {
            reject: wire.reject,
            reject_reason: wire.reject_reason,
            unchange: wire.unchange,
            content,
        })
    }
}

/// `addr + path`, defaulting to plain HTTP when no scheme is given
fn plugin_url(addr: &str, path: &str) -> String {
    let url = format!("{addr}{path}");
    if url.starts_with("http://") || url.starts_with("https://") {
        url
    } else {
        format!("http://{url}")
    }
}
