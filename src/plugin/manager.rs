//! Plugin registry and dispatch
//!
//! Plugins are registered once at startup and appended, per operation, in
//! registration order. Dispatch never mutates the registry, so a [`Manager`]
//! can be shared behind an `Arc` without locking.
//!
//! Gating operations (everything except `CloseProxy`) run the chain
//! sequentially and stop at the first veto or failure. `CloseProxy` is a
//! notification: every plugin is called and failures are reported together.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{Instrument, debug, debug_span, warn};

use super::{
    CloseProxyContent, HttpPlugin, LoginContent, NewProxyContent, NewUserConnContent,
    NewWorkConnContent, OpContent, Operation, PingContent, Plugin, PluginContext,
};
use crate::config::HttpPluginOptions;
use crate::{Error, Result};

/// Per-operation ordered plugin registry and composite gateway
#[derive(Default)]
pub struct Manager {
    plugins: HashMap<Operation, Vec<Arc<dyn Plugin>>>,
}

impl Manager {
    /// Empty registry; every operation passes through unchanged
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP plugins from descriptors, registering them in config order
    pub fn from_options(options: &[HttpPluginOptions]) -> Result<Self> {
        let mut manager = Self::new();
        for opts in options {
            manager.register(Arc::new(HttpPlugin::new(opts)?));
        }
        Ok(manager)
    }

    /// Append `plugin` to the chain of every operation it supports
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        for op in Operation::ALL {
            if plugin.is_support(op) {
                debug!(plugin = %plugin.name(), op = %op, "Registered plugin");
                self.plugins.entry(op).or_default().push(Arc::clone(&plugin));
            }
        }
    }

    /// Plugins for `op`, in invocation order
    #[must_use]
    pub fn plugins_for(&self, op: Operation) -> &[Arc<dyn Plugin>] {
        self.plugins.get(&op).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run a login through its plugins
    pub async fn login(&self, content: LoginContent) -> Result<LoginContent> {
        self.do_request(content).await
    }

    /// Run a proxy registration through its plugins
    pub async fn new_proxy(&self, content: NewProxyContent) -> Result<NewProxyContent> {
        self.do_request(content).await
    }

    /// Run a heartbeat through its plugins
    pub async fn ping(&self, content: PingContent) -> Result<PingContent> {
        self.do_request(content).await
    }

    /// Run a work connection through its plugins
    pub async fn new_work_conn(&self, content: NewWorkConnContent) -> Result<NewWorkConnContent> {
        self.do_request(content).await
    }

    /// Run an incoming user connection through its plugins
    pub async fn new_user_conn(&self, content: NewUserConnContent) -> Result<NewUserConnContent> {
        self.do_request(content).await
    }

    /// Notify every `CloseProxy` plugin; failures are collected, not short-circuited
    pub async fn close_proxy(&self, content: CloseProxyContent) -> Result<()> {
        let op = Operation::CloseProxy;
        let plugins = self.plugins_for(op);
        if plugins.is_empty() {
            return Ok(());
        }

        let ctx = PluginContext::new();
        let span = debug_span!("plugin", req_id = %ctx.req_id, op = %op);
        let content = content.into_content();

        async move {
            let mut errors = Vec::new();
            for plugin in plugins {
                match plugin.handle(&ctx, op, &content).await {
                    Ok(res) if res.reject => {
                        debug!(plugin = %plugin.name(), reason = %res.reject_reason, "Rejection ignored for notification");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(plugin = %plugin.name(), error = %e, "Plugin notification failed");
                        errors.push((plugin.name().to_string(), e));
                    }
                }
            }

            if errors.is_empty() {
                Ok(())
            } else {
                Err(Error::PluginErrors {
                    op: op.to_string(),
                    errors,
                })
            }
        }
        .instrument(span)
        .await
    }

    async fn do_request<T: OpContent>(&self, content: T) -> Result<T> {
        let op = T::OP;
        let plugins = self.plugins_for(op);
        if plugins.is_empty() {
            return Ok(content);
        }

        let ctx = PluginContext::new();
        let span = debug_span!("plugin", req_id = %ctx.req_id, op = %op);

        async move {
            let mut current = content.into_content();
            for plugin in plugins {
                let res = plugin.handle(&ctx, op, &current).await.map_err(|e| {
                    warn!(plugin = %plugin.name(), error = %e, "Plugin request failed");
                    plugin_failed(op, plugin.as_ref(), e)
                })?;

                if res.reject {
                    debug!(plugin = %plugin.name(), reason = %res.reject_reason, "Operation rejected");
                    return Err(Error::PluginRejected(res.reject_reason));
                }
                if res.unchange {
                    continue;
                }

                match res.content {
                    Some(next) if next.operation() == op => {
                        debug!(plugin = %plugin.name(), "Content rewritten");
                        current = next;
                    }
                    Some(next) => {
                        let e = Error::Transport(format!(
                            "content for {} returned to a {op} request",
                            next.operation()
                        ));
                        return Err(plugin_failed(op, plugin.as_ref(), e));
                    }
                    None => {
                        let e = Error::Transport(
                            "response is neither unchanged nor carries content".to_string(),
                        );
                        return Err(plugin_failed(op, plugin.as_ref(), e));
                    }
                }
            }

            T::from_content(current)
                .ok_or_else(|| Error::Transport(format!("content lost its {op} type")))
        }
        .instrument(span)
        .await
    }
}

fn plugin_failed(op: Operation, plugin: &dyn Plugin, source: Error) -> Error {
    Error::PluginFailed {
        op: op.to_string(),
        plugin: plugin.name().to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Content, Response};

    struct Named(&'static str, Vec<Operation>);

    #[async_trait::async_trait]
    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn is_support(&self, op: Operation) -> bool {
            self.1.contains(&op)
        }

        async fn handle(
            &self,
            _ctx: &PluginContext,
            _op: Operation,
            _content: &Content,
        ) -> Result<Response> {
            Ok(Response::unchanged())
        }
    }

    #[test]
    fn register_appends_per_supported_operation() {
        // GIVEN: two plugins with overlapping ops
        let mut manager = Manager::new();
        manager.register(Arc::new(Named("a", vec![Operation::Login, Operation::Ping])));
        manager.register(Arc::new(Named("b", vec![Operation::Login])));

        // THEN: registration order is kept per op
        let login: Vec<_> = manager
            .plugins_for(Operation::Login)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(login, vec!["a", "b"]);
        assert_eq!(manager.plugins_for(Operation::Ping).len(), 1);
        assert!(manager.plugins_for(Operation::CloseProxy).is_empty());
    }

    #[test]
    fn from_options_keeps_config_order() {
        let options = vec![
            HttpPluginOptions {
                name: "first".to_string(),
                addr: "127.0.0.1:1".to_string(),
                ops: vec![Operation::NewProxy],
                ..Default::default()
            },
            HttpPluginOptions {
                name: "second".to_string(),
                addr: "127.0.0.1:2".to_string(),
                ops: vec![Operation::NewProxy],
                ..Default::default()
            },
        ];

        let manager = Manager::from_options(&options).unwrap();
        let names: Vec<_> = manager
            .plugins_for(Operation::NewProxy)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
