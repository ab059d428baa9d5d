//! Runtime: owns the connection cache and routes list/call requests
//!
//! `list_all` goes through the discovery scheduler and never fails per server.
//! `call_tool`, `list_tools` and `authorize` target one server and propagate
//! their errors to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::cache::ConnectionCache;
use super::discovery::{DiscoveryScheduler, ListOutcome};
use super::oauth::{AuthorizingConnector, OAuthFlow, OAuthGate};
use super::transport::{ConnectOptions, Connection, Connector, TransportError};
use super::types::{ServerDefinition, ToolInfo};
use crate::config::RuntimeSettings;

/// Errors from single-server operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A required input was empty; nothing was attempted
    #[error("missing {0}")]
    MissingInput(&'static str),

    #[error("unknown MCP server '{0}'")]
    UnknownServer(String),

    #[error("MCP server '{server}': {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },
}

impl RuntimeError {
    fn transport(server: &str, source: TransportError) -> Self {
        RuntimeError::Transport {
            server: server.to_string(),
            source,
        }
    }
}

/// Client runtime over a fixed set of server definitions
pub struct Runtime {
    servers: Vec<ServerDefinition>,
    cache: ConnectionCache,
    gate: OAuthGate,
    settings: RuntimeSettings,
}

impl Runtime {
    pub fn new(servers: Vec<ServerDefinition>, connector: Arc<dyn Connector>, settings: RuntimeSettings) -> Self {
        Self {
            servers,
            cache: ConnectionCache::new(connector),
            gate: OAuthGate::new(settings.token_root.clone()),
            settings,
        }
    }

    /// Runtime whose connections may run `flow` when a server demands auth
    pub fn with_oauth_flow(
        servers: Vec<ServerDefinition>,
        connector: Arc<dyn Connector>,
        flow: Arc<dyn OAuthFlow>,
        settings: RuntimeSettings,
    ) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(AuthorizingConnector::new(connector, flow));
        Self::new(servers, connector, settings)
    }

    /// Configured servers, in configuration order
    pub fn servers(&self) -> &[ServerDefinition] {
        &self.servers
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub fn definition(&self, server: &str) -> Result<&ServerDefinition, RuntimeError> {
        if server.trim().is_empty() {
            return Err(RuntimeError::MissingInput("server name"));
        }
        self.servers
            .iter()
            .find(|s| s.name == server)
            .ok_or_else(|| RuntimeError::UnknownServer(server.to_string()))
    }

    /// List tools from every server
    pub async fn list_all(&self) -> Vec<ListOutcome> {
        self.scheduler().run(&self.servers).await
    }

    /// Discovery scheduler bound to this runtime's cache and settings
    pub fn scheduler(&self) -> DiscoveryScheduler<'_> {
        DiscoveryScheduler::new(
            &self.cache,
            &self.gate,
            self.settings.list_timeout,
            self.settings.auto_authorize,
        )
    }

    /// List tools from one server
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolInfo>, RuntimeError> {
        let definition = self.gated(server)?;
        let timeout = self.settings.list_timeout;
        self.with_connection(&definition, timeout, |conn| async move { conn.list_tools().await })
            .await
    }

    /// Call a tool on one server
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Option<Value>) -> Result<Value, RuntimeError> {
        if tool.trim().is_empty() {
            return Err(RuntimeError::MissingInput("tool name"));
        }
        let definition = self.gated(server)?;
        tracing::debug!("Calling '{}' on MCP server '{}'", tool, server);

        let timeout = self.settings.call_timeout;
        self.with_connection(&definition, timeout, |conn| async move { conn.call_tool(tool, arguments).await })
            .await
    }

    /// Connect once with interactive authorization allowed
    pub async fn authorize(&self, server: &str) -> Result<(), RuntimeError> {
        let definition = self.gated(server)?;
        let acquired = self
            .cache
            .get_or_create(&definition, ConnectOptions { interactive_auth: true })
            .await
            .map_err(|e| RuntimeError::transport(server, e))?;
        self.cache.release(acquired).await;
        Ok(())
    }

    /// Close every cached connection; call before exit
    pub async fn close(&self) {
        self.cache.close_all().await;
    }

    fn gated(&self, server: &str) -> Result<ServerDefinition, RuntimeError> {
        let definition = self.definition(server)?;
        Ok(self
            .gate
            .maybe_enable_oauth(definition)
            .unwrap_or_else(|| definition.clone()))
    }

    /// Acquire, run `op` within `timeout`, settle, propagate
    async fn with_connection<T, F, Fut>(
        &self,
        definition: &ServerDefinition,
        timeout: Duration,
        op: F,
    ) -> Result<T, RuntimeError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let name = definition.name.as_str();
        let acquired = self
            .cache
            .get_or_create(definition, ConnectOptions { interactive_auth: true })
            .await
            .map_err(|e| RuntimeError::transport(name, e))?;

        let result = tokio::time::timeout(timeout, op(acquired.shared()))
            .await
            .map_err(|_| TransportError::Timeout(timeout))
            .and_then(|r| r);

        self.cache.settle(acquired, &result).await;
        result.map_err(|e| RuntimeError::transport(name, e))
    }
}
