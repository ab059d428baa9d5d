//! Configuration loading
//!
//! Two inputs, both read once at startup:
//! - the server file (`config/mcporter.json` or `.mcp.json`), a JSON map of
//!   `mcpServers` plus optional `imports` of other files with the same shape;
//! - runtime settings (`.mcporter.toml`), overridden by CLI flags and
//!   environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::mcp::discovery::DEFAULT_LIST_TIMEOUT;
use crate::mcp::lifecycle::{resolve_lifecycle, LifecycleOverrides, OverrideSet, RawLifecycle};
use crate::mcp::oauth::OAuthGate;
use crate::mcp::{AuthMode, CommandSpec, ServerDefinition, ServerSource};

/// Server config file names, checked in each directory walking up from cwd
const SERVER_FILES: &[&str] = &["config/mcporter.json", ".mcp.json"];

/// Runtime settings file name
const SETTINGS_FILE: &str = ".mcporter.toml";

/// Default tool call timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/mcporter/
fn find_config_file(candidates: &[&str], global_name: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        for filename in candidates {
            let candidate = current.join(filename);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("mcporter").join(global_name);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

// ============================================================================
// Server definitions
// ============================================================================

/// Server config file (`mcpServers` keeps file order)
#[derive(Debug, Deserialize)]
struct ServerFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: Map<String, Value>,
    #[serde(default)]
    imports: Vec<String>,
}

/// One entry under `mcpServers`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServer {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(alias = "baseUrl")]
    url: Option<String>,
    description: Option<String>,
    auth: Option<String>,
    token_cache_dir: Option<PathBuf>,
    lifecycle: Option<RawLifecycle>,
}

/// Load server definitions from the config file
///
/// Uses `explicit` when given, otherwise searches for a server file. Returns
/// an empty list when no file exists.
pub fn load_servers(explicit: Option<&Path>, overrides: &LifecycleOverrides) -> Result<Vec<ServerDefinition>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match find_config_file(SERVER_FILES, "mcporter.json") {
            Some(path) => path,
            None => {
                tracing::debug!("No MCP server config found");
                return Ok(Vec::new());
            }
        },
    };
    load_servers_from_path(&path, overrides)
}

/// Load server definitions from a specific file, following its imports
pub fn load_servers_from_path(path: &Path, overrides: &LifecycleOverrides) -> Result<Vec<ServerDefinition>> {
    tracing::debug!("Loading MCP servers from: {}", path.display());
    let file = read_server_file(path)?;

    let source = ServerSource::Local {
        path: path.to_path_buf(),
    };
    let mut servers = parse_servers(&file.mcp_servers, &source, path, overrides)?;

    for import in &file.imports {
        let import_path = resolve_import(path, import);
        if !import_path.exists() {
            tracing::debug!("Skipping missing import: {}", import_path.display());
            continue;
        }
        let imported = read_server_file(&import_path)?;
        let source = ServerSource::Import {
            path: import_path.clone(),
        };
        for server in parse_servers(&imported.mcp_servers, &source, &import_path, overrides)? {
            // Local definitions win over imported ones
            if !servers.iter().any(|s| s.name == server.name) {
                servers.push(server);
            }
        }
    }

    Ok(servers)
}

fn read_server_file(path: &Path) -> Result<ServerFile> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Imports are `~`/`$VAR` expanded and relative to the importing file
fn resolve_import(from: &Path, import: &str) -> PathBuf {
    let expanded = shellexpand::full(import)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| import.to_string());
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        from.parent().unwrap_or_else(|| Path::new(".")).join(path)
    }
}

fn parse_servers(
    entries: &Map<String, Value>,
    source: &ServerSource,
    file: &Path,
    overrides: &LifecycleOverrides,
) -> Result<Vec<ServerDefinition>> {
    entries
        .iter()
        .map(|(name, value)| {
            let raw: RawServer = serde_json::from_value(value.clone())
                .with_context(|| format!("Invalid MCP server '{}' in {}", name, file.display()))?;
            build_definition(name, raw, source.clone(), overrides)
                .with_context(|| format!("Invalid MCP server '{}' in {}", name, file.display()))
        })
        .collect()
}

fn build_definition(
    name: &str,
    raw: RawServer,
    source: ServerSource,
    overrides: &LifecycleOverrides,
) -> Result<ServerDefinition> {
    let command = match (raw.url, raw.command) {
        (Some(url), _) => {
            url::Url::parse(&url).with_context(|| format!("invalid url '{}'", url))?;
            CommandSpec::Http { url }
        }
        (None, Some(command)) => CommandSpec::Stdio {
            command,
            args: raw.args,
            cwd: raw.cwd,
        },
        (None, None) => bail!("either 'command' or 'url' is required"),
    };

    let auth = match raw.auth.as_deref().map(str::to_lowercase).as_deref() {
        None => None,
        Some("oauth") => Some(AuthMode::OAuth),
        Some(other) => bail!("unsupported auth mode '{}'", other),
    };

    let lifecycle = resolve_lifecycle(name, raw.lifecycle.as_ref(), &command, overrides);

    Ok(ServerDefinition {
        name: name.to_string(),
        command,
        env: raw.env,
        source,
        description: raw.description,
        auth,
        token_cache_dir: raw.token_cache_dir,
        lifecycle,
    })
}

// ============================================================================
// Runtime settings (.mcporter.toml)
// ============================================================================

/// Settings file contents
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// `[runtime]` section
#[derive(Debug, Default, Deserialize)]
pub struct RuntimeSection {
    pub list_timeout_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
    pub keep_alive: Option<String>,
    pub disable_keep_alive: Option<String>,
    pub auto_authorize: Option<bool>,
    pub token_root: Option<PathBuf>,
}

impl SettingsFile {
    /// Load `.mcporter.toml`, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        if let Some(path) = find_config_file(&[SETTINGS_FILE], "mcporter.toml") {
            tracing::debug!("Loading settings from: {}", path.display());
            return Self::load_from_path(&path);
        }
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Values that take precedence over the settings file (CLI flags / env)
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    pub list_timeout_ms: Option<u64>,
    pub keep_alive: Option<String>,
    pub disable_keep_alive: Option<String>,
    pub auto_authorize: Option<bool>,
}

/// Immutable runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    /// Per-server discovery budget
    pub list_timeout: Duration,
    /// Budget for a single tool call
    pub call_timeout: Duration,
    pub lifecycle_overrides: LifecycleOverrides,
    /// Whether discovery may start interactive OAuth flows
    pub auto_authorize: bool,
    /// Parent directory of per-server token caches
    pub token_root: PathBuf,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            list_timeout: DEFAULT_LIST_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            lifecycle_overrides: LifecycleOverrides::default(),
            auto_authorize: false,
            token_root: OAuthGate::default_token_root(),
        }
    }
}

impl RuntimeSettings {
    /// Merge the settings file with CLI/env overrides
    pub fn resolve(file: SettingsFile, overrides: SettingsOverrides) -> Self {
        let defaults = Self::default();
        let runtime = file.runtime;

        let list_timeout = overrides
            .list_timeout_ms
            .or(runtime.list_timeout_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.list_timeout);
        let call_timeout = runtime
            .call_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.call_timeout);

        let force_keep_alive = overrides
            .keep_alive
            .or(runtime.keep_alive)
            .map(|raw| OverrideSet::parse(&raw))
            .unwrap_or_default();
        let disable_keep_alive = overrides
            .disable_keep_alive
            .or(runtime.disable_keep_alive)
            .map(|raw| OverrideSet::parse(&raw))
            .unwrap_or_default();

        Self {
            list_timeout,
            call_timeout,
            lifecycle_overrides: LifecycleOverrides {
                force_keep_alive,
                disable_keep_alive,
            },
            auto_authorize: overrides.auto_authorize.or(runtime.auto_authorize).unwrap_or(false),
            token_root: runtime.token_root.unwrap_or(defaults.token_root),
        }
    }
}
