//! MCP type definitions
//!
//! Server definitions and tool descriptions shared by the resolver, the OAuth
//! gate, the connection cache and the discovery scheduler.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use super::lifecycle::ServerLifecycle;

/// Source path used for definitions synthesized at runtime (not file-backed)
pub const ADHOC_SOURCE_PATH: &str = "<adhoc>";

/// How to reach a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Spawn a subprocess and speak MCP over its stdin/stdout
    Stdio {
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
    },
    /// Connect to a streamable HTTP endpoint
    Http { url: String },
}

impl CommandSpec {
    pub fn is_http(&self) -> bool {
        matches!(self, CommandSpec::Http { .. })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Stdio { command, args, .. } if args.is_empty() => write!(f, "{}", command),
            CommandSpec::Stdio { command, args, .. } => write!(f, "{} {}", command, args.join(" ")),
            CommandSpec::Http { url } => write!(f, "{}", url),
        }
    }
}

/// Where a definition came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSource {
    /// The primary config file, or [`ADHOC_SOURCE_PATH`] for ad-hoc servers
    Local { path: PathBuf },
    /// A file listed under `imports` in the primary config
    Import { path: PathBuf },
}

impl ServerSource {
    pub fn adhoc() -> Self {
        ServerSource::Local {
            path: PathBuf::from(ADHOC_SOURCE_PATH),
        }
    }

    /// True when the definition was synthesized at runtime
    pub fn is_adhoc(&self) -> bool {
        matches!(self, ServerSource::Local { path } if path.as_os_str() == ADHOC_SOURCE_PATH)
    }
}

/// Authentication mode attached to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    OAuth,
}

/// A fully resolved server definition
///
/// Read-only once built. The OAuth gate derives a new definition instead of
/// mutating this one.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDefinition {
    pub name: String,
    pub command: CommandSpec,
    /// Environment for stdio servers (values may reference `${VAR}`)
    pub env: HashMap<String, String>,
    pub source: ServerSource,
    pub description: Option<String>,
    pub auth: Option<AuthMode>,
    pub token_cache_dir: Option<PathBuf>,
    pub lifecycle: Option<ServerLifecycle>,
}

impl ServerDefinition {
    /// Minimal definition; callers fill in the optional fields they need
    pub fn new(name: impl Into<String>, command: CommandSpec, source: ServerSource) -> Self {
        Self {
            name: name.into(),
            command,
            env: HashMap::new(),
            source,
            description: None,
            auth: None,
            token_cache_dir: None,
            lifecycle: None,
        }
    }

    /// Ad-hoc HTTP server, as created from `--http-url`
    pub fn adhoc_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, CommandSpec::Http { url: url.into() }, ServerSource::adhoc())
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(self.lifecycle, Some(ServerLifecycle::KeepAlive { .. }))
    }
}

/// A tool from an MCP server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInfo {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema (JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }
}
