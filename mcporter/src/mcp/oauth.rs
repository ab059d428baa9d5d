//! OAuth gate for ad-hoc HTTP servers
//!
//! Ad-hoc HTTP servers (given on the command line rather than in a config
//! file) are upgraded to OAuth before any connection attempt, each with its
//! own token-cache directory. Interactive authorization is a separate
//! collaborator ([`OAuthFlow`]) that only runs when the caller allows it, so
//! bulk discovery never stalls on a browser or terminal prompt.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::transport::{ConnectOptions, Connection, Connector, TransportError};
use super::types::{AuthMode, ServerDefinition};

/// File inside a token-cache directory holding the access token
const TOKEN_FILE: &str = "token.json";

// =============================================================================
// Gate
// =============================================================================

/// Decides which definitions get OAuth attached
#[derive(Debug, Clone)]
pub struct OAuthGate {
    token_root: PathBuf,
}

impl OAuthGate {
    /// Gate whose token-cache directories live under `token_root`
    pub fn new(token_root: impl Into<PathBuf>) -> Self {
        Self {
            token_root: token_root.into(),
        }
    }

    /// Default token root: `~/.mcporter/credentials`
    pub fn default_token_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".mcporter")
            .join("credentials")
    }

    /// Upgrade an ad-hoc HTTP definition to OAuth
    ///
    /// Returns `None` (no change) for stdio servers, file-backed servers, and
    /// definitions that already carry an auth mode.
    pub fn maybe_enable_oauth(&self, definition: &ServerDefinition) -> Option<ServerDefinition> {
        if !definition.command.is_http() || !definition.source.is_adhoc() || definition.auth.is_some() {
            return None;
        }

        let token_cache_dir = definition
            .token_cache_dir
            .clone()
            .unwrap_or_else(|| self.token_cache_dir(&definition.name));

        tracing::info!(
            "Enabling OAuth for ad-hoc server '{}' (tokens in {})",
            definition.name,
            token_cache_dir.display()
        );

        Some(ServerDefinition {
            auth: Some(AuthMode::OAuth),
            token_cache_dir: Some(token_cache_dir),
            ..definition.clone()
        })
    }

    /// Token-cache directory for a server name
    pub fn token_cache_dir(&self, name: &str) -> PathBuf {
        self.token_root.join(encode_dir_name(name))
    }
}

/// Map a server name to a directory name, injectively
///
/// ASCII letters, digits and `-` are kept; every other byte becomes `_xx`.
/// Because `_` itself is always escaped, two distinct names can never map to
/// the same directory.
fn encode_dir_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

// =============================================================================
// Token cache
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    access_token: String,
}

/// Read the cached access token, if any
pub async fn load_cached_token(dir: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(dir.join(TOKEN_FILE)).await.ok()?;
    match serde_json::from_str::<TokenFile>(&content) {
        Ok(file) if !file.access_token.trim().is_empty() => Some(file.access_token),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Ignoring unreadable token cache in {}: {}", dir.display(), e);
            None
        }
    }
}

/// Store an access token in a token-cache directory
pub async fn store_token(dir: &Path, access_token: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec_pretty(&TokenFile {
        access_token: access_token.to_string(),
    })?;
    tokio::fs::write(dir.join(TOKEN_FILE), body).await
}

// =============================================================================
// Interactive flow
// =============================================================================

/// An interactive authorization flow that leaves a token in the cache
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    async fn authorize(&self, definition: &ServerDefinition) -> Result<(), TransportError>;
}

/// Asks the operator to paste an access token on stdin
#[derive(Debug, Default)]
pub struct StdinTokenFlow;

#[async_trait]
impl OAuthFlow for StdinTokenFlow {
    async fn authorize(&self, definition: &ServerDefinition) -> Result<(), TransportError> {
        let dir = definition.token_cache_dir.as_deref().ok_or_else(|| {
            TransportError::Unauthorized(format!("server '{}' has no token cache directory", definition.name))
        })?;

        eprintln!(
            "Server '{}' requires authorization. Paste an access token and press Enter:",
            definition.name
        );
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| TransportError::Unauthorized(format!("failed to read token: {}", e)))?;

        let token = line.trim();
        if token.is_empty() {
            return Err(TransportError::Unauthorized("no access token entered".to_string()));
        }
        store_token(dir, token)
            .await
            .map_err(|e| TransportError::Unauthorized(format!("failed to store token: {}", e)))?;

        tracing::info!("Stored access token for '{}' in {}", definition.name, dir.display());
        Ok(())
    }
}

/// Connector decorator that runs the OAuth flow after an auth rejection
///
/// The flow only runs for OAuth definitions and only when the attempt allows
/// interactive auth; otherwise the `Unauthorized` error is returned as-is.
pub struct AuthorizingConnector {
    inner: Arc<dyn Connector>,
    flow: Arc<dyn OAuthFlow>,
}

impl AuthorizingConnector {
    pub fn new(inner: Arc<dyn Connector>, flow: Arc<dyn OAuthFlow>) -> Self {
        Self { inner, flow }
    }
}

#[async_trait]
impl Connector for AuthorizingConnector {
    async fn connect(
        &self,
        definition: &ServerDefinition,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        match self.inner.connect(definition, options).await {
            Err(TransportError::Unauthorized(reason))
                if options.interactive_auth && definition.auth == Some(AuthMode::OAuth) =>
            {
                tracing::info!("Server '{}' requires authorization: {}", definition.name, reason);
                self.flow.authorize(definition).await?;
                self.inner.connect(definition, options).await
            }
            other => other,
        }
    }
}
