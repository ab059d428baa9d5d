//! Concurrent tool discovery
//!
//! Lists tools from every configured server at once. Each server gets its own
//! deadline; a timeout or failure only affects that server's outcome, and
//! outcomes come back in configuration order regardless of completion order.

use std::fmt;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;

use super::cache::ConnectionCache;
use super::oauth::OAuthGate;
use super::transport::{ConnectOptions, TransportError};
use super::types::{ServerDefinition, ToolInfo};

/// Default per-server discovery budget (30 seconds)
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Per-server discovery state; `Ok` and `Failed` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Pending,
    Running,
    Ok,
    Failed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Pending => "pending",
            ServerState::Running => "running",
            ServerState::Ok => "ok",
            ServerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of listing one server
#[derive(Debug, Clone)]
pub enum ListStatus {
    Ok { tools: Vec<ToolInfo> },
    Error { error: TransportError },
}

/// One server's discovery outcome
#[derive(Debug, Clone)]
pub struct ListOutcome {
    /// The definition as configured (before the OAuth gate)
    pub definition: ServerDefinition,
    pub status: ListStatus,
    pub duration: Duration,
}

impl ListOutcome {
    pub fn state(&self) -> ServerState {
        match self.status {
            ListStatus::Ok { .. } => ServerState::Ok,
            ListStatus::Error { .. } => ServerState::Failed,
        }
    }
}

/// Fans "list tools" out across servers
pub struct DiscoveryScheduler<'a> {
    cache: &'a ConnectionCache,
    gate: &'a OAuthGate,
    timeout: Duration,
    interactive_auth: bool,
}

impl<'a> DiscoveryScheduler<'a> {
    /// `interactive_auth` should only be set when auto-authorization is
    /// enabled; otherwise auth failures are reported, not prompted for
    pub fn new(cache: &'a ConnectionCache, gate: &'a OAuthGate, timeout: Duration, interactive_auth: bool) -> Self {
        Self {
            cache,
            gate,
            timeout,
            interactive_auth,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// List every server concurrently; never fails as a whole
    pub async fn run(&self, servers: &[ServerDefinition]) -> Vec<ListOutcome> {
        for server in servers {
            tracing::debug!(server = %server.name, state = %ServerState::Pending, "discovery");
        }
        join_all(servers.iter().map(|server| self.list_one(server))).await
    }

    async fn list_one(&self, definition: &ServerDefinition) -> ListOutcome {
        let started = Instant::now();
        tracing::debug!(server = %definition.name, state = %ServerState::Running, "discovery");

        let gated = self.gate.maybe_enable_oauth(definition);
        let target = gated.as_ref().unwrap_or(definition);

        let status = match self.fetch(target, started + self.timeout).await {
            Ok(tools) => ListStatus::Ok { tools },
            Err(error) => ListStatus::Error { error },
        };

        let outcome = ListOutcome {
            definition: definition.clone(),
            status,
            duration: started.elapsed(),
        };
        match &outcome.status {
            ListStatus::Ok { tools } => tracing::debug!(
                server = %definition.name,
                state = %ServerState::Ok,
                tools = tools.len(),
                "discovery"
            ),
            ListStatus::Error { error } => tracing::debug!(
                server = %definition.name,
                state = %ServerState::Failed,
                error = %error,
                "discovery"
            ),
        }
        outcome
    }

    async fn fetch(&self, definition: &ServerDefinition, deadline: Instant) -> Result<Vec<ToolInfo>, TransportError> {
        let options = ConnectOptions {
            interactive_auth: self.interactive_auth,
        };

        let acquired = tokio::time::timeout_at(deadline, self.cache.get_or_create(definition, options))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        let result = tokio::time::timeout_at(deadline, acquired.connection().list_tools())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))
            .and_then(|listed| listed);

        // Closes ephemeral connections whether or not the listing succeeded,
        // and drops a cached one whose transport went away
        self.cache.settle(acquired, &result).await;
        result
    }
}
