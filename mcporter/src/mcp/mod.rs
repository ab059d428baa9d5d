//! MCP client runtime
//!
//! Connection lifecycle and discovery over rmcp:
//! - `lifecycle`: keep-alive vs ephemeral resolution
//! - `oauth`: OAuth gate for ad-hoc HTTP servers
//! - `cache`: at most one live connection per keep-alive server
//! - `classify`: failure taxonomy for listings
//! - `discovery`: concurrent "list tools" across servers

pub mod cache;
pub mod classify;
pub mod discovery;
pub mod lifecycle;
pub mod oauth;
mod runtime;
pub mod transport;
mod types;

pub use cache::{Acquired, ConnectionCache};
pub use classify::{classify, is_connection_lost, Category, Classification};
pub use discovery::{DiscoveryScheduler, ListOutcome, ListStatus, ServerState, DEFAULT_LIST_TIMEOUT};
pub use lifecycle::{resolve_lifecycle, LifecycleOverrides, OverrideSet, RawLifecycle, ServerLifecycle};
pub use oauth::{OAuthFlow, OAuthGate, StdinTokenFlow};
pub use runtime::{Runtime, RuntimeError};
pub use transport::{ConnectOptions, Connection, Connector, RmcpConnector, TransportError};
pub use types::{AuthMode, CommandSpec, ServerDefinition, ServerSource, ToolInfo, ADHOC_SOURCE_PATH};
