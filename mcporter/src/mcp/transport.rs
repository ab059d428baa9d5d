//! Transport seam over the rmcp client
//!
//! [`Connector`] opens a [`Connection`] for a server definition. The rmcp
//! implementation spawns stdio servers as child processes or connects to
//! streamable HTTP endpoints; tests substitute their own connectors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam,
    service::{Peer, RunningService},
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig, StreamableHttpClientTransport,
        TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::oauth::load_cached_token;
use super::types::{CommandSpec, ServerDefinition, ToolInfo};

/// Errors raised by connections and connectors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The server rejected our credentials (or we had none)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server answered with an HTTP error status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Spawning or initializing the server failed
    #[error("{0}")]
    Connect(String),

    /// A request on an established connection failed
    #[error("{0}")]
    Request(String),

    /// The request was rejected before any connection attempt
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation did not finish within its budget
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Options for a single connection attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Whether an interactive OAuth flow may run if the server demands auth
    pub interactive_auth: bool,
}

/// A live connection to one MCP server
#[async_trait]
pub trait Connection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError>;

    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value, TransportError>;

    /// Close the connection; later requests fail
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the transport has gone away (server exited, session dropped)
    fn is_closed(&self) -> bool {
        false
    }
}

/// Opens connections for server definitions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        definition: &ServerDefinition,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

// =============================================================================
// rmcp implementation
// =============================================================================

/// Connector backed by the rmcp client (child process or streamable HTTP)
#[derive(Debug, Default, Clone)]
pub struct RmcpConnector;

impl RmcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(
        &self,
        definition: &ServerDefinition,
        _options: ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let name = &definition.name;

        let service = match &definition.command {
            CommandSpec::Stdio { command, args, cwd } => {
                tracing::debug!("Spawning MCP server '{}': {}", name, definition.command);

                let mut cmd = Command::new(command);
                if !args.is_empty() {
                    cmd.args(args);
                }
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }
                for (key, value) in &definition.env {
                    let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
                    cmd.env(key, expanded.as_ref());
                }

                let transport = TokioChildProcess::new(cmd)
                    .map_err(|e| TransportError::Connect(format!("failed to spawn '{}': {}", command, e)))?;
                ().serve(transport).await.map_err(|e| map_init_error(e.to_string()))?
            }
            CommandSpec::Http { url } => {
                tracing::debug!("Connecting to MCP server '{}' at {}", name, url);

                let mut config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                if let Some(dir) = &definition.token_cache_dir {
                    config.auth_header = load_cached_token(dir).await;
                }
                let transport = StreamableHttpClientTransport::from_config(config);
                ().serve(transport).await.map_err(|e| map_init_error(e.to_string()))?
            }
        };

        tracing::info!("Connected to MCP server '{}'", name);
        Ok(Arc::new(RmcpConnection::new(name.clone(), service)))
    }
}

/// Turn an rmcp initialization failure into a transport error, recognizing
/// authorization rejections from the HTTP layer
fn map_init_error(message: String) -> TransportError {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("auth required") {
        TransportError::Unauthorized(message)
    } else {
        TransportError::Connect(message)
    }
}

/// A running rmcp client session
struct RmcpConnection {
    name: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpConnection {
    fn new(name: String, service: RunningService<RoleClient, ()>) -> Self {
        Self {
            name,
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl Connection for RmcpConnection {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| TransportError::Request(format!("failed to list tools: {}", e)))?;

        Ok(tools
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: serde_json::to_value(&t.input_schema).ok(),
            })
            .collect())
    }

    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value, TransportError> {
        let args = arguments.and_then(|v| v.as_object().cloned());
        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments: args,
                task: None,
            })
            .await
            .map_err(|e| TransportError::Request(format!("failed to call tool '{}': {}", tool_name, e)))?;

        serde_json::to_value(&result).map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        tracing::debug!("Closing MCP server '{}'", self.name);
        service
            .cancel()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Request(format!("failed to close '{}': {}", self.name, e)))
    }

    fn is_closed(&self) -> bool {
        self.peer.is_transport_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_init_error() {
        assert!(matches!(
            map_init_error("Unexpected server response: HTTP 401".to_string()),
            TransportError::Unauthorized(_)
        ));
        assert!(matches!(
            map_init_error("Auth required".to_string()),
            TransportError::Unauthorized(_)
        ));
        assert!(matches!(
            map_init_error("connection refused".to_string()),
            TransportError::Connect(_)
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::Timeout(Duration::from_millis(30000)).to_string(),
            "timed out after 30000ms"
        );
        let http = TransportError::Http {
            status: 403,
            message: "nope".to_string(),
        };
        assert_eq!(http.status(), Some(403));
        assert_eq!(http.to_string(), "HTTP 403: nope");
    }
}
