//! Keep-alive vs ephemeral lifecycle resolution
//!
//! Decides, per server, whether a connection is reused across calls. The
//! override sets are built once at startup and passed in explicitly.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use super::types::CommandSpec;

/// Idle timeout applied to keep-alive servers that do not set one (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Server names that keep their connection alive unless configured otherwise
const DEFAULT_KEEP_ALIVE: &[&str] = &["chrome-devtools", "mobile-mcp", "playwright"];

/// Command fragments of servers that are expensive to relaunch
const KEEP_ALIVE_COMMAND_FRAGMENTS: &[&str] = &["chrome-devtools-mcp", "@playwright/mcp", "mobile-mcp"];

/// Connection lifecycle policy for a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycle {
    /// Reuse one connection until it has been idle for `idle_timeout`
    /// (or [`DEFAULT_IDLE_TIMEOUT`] when unset)
    KeepAlive { idle_timeout: Option<Duration> },
    /// Connect and close around every operation
    Ephemeral,
}

impl ServerLifecycle {
    pub fn keep_alive() -> Self {
        ServerLifecycle::KeepAlive { idle_timeout: None }
    }

    /// Effective idle timeout for keep-alive servers
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self {
            ServerLifecycle::KeepAlive { idle_timeout } => Some(idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT)),
            ServerLifecycle::Ephemeral => None,
        }
    }
}

/// Lifecycle as written in the config file
///
/// Accepts `"keep-alive"` / `"ephemeral"` or
/// `{ "mode": "keep-alive", "idleTimeoutMs": 60000 }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawLifecycle {
    Mode(String),
    Detailed {
        mode: String,
        #[serde(default, rename = "idleTimeoutMs")]
        idle_timeout_ms: Option<f64>,
    },
}

/// A set of server names, or every name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideSet {
    All,
    Names(HashSet<String>),
}

impl Default for OverrideSet {
    fn default() -> Self {
        OverrideSet::Names(HashSet::new())
    }
}

impl OverrideSet {
    /// Parse a comma-separated, case-insensitive list; `*` means every name
    pub fn parse(raw: &str) -> Self {
        let mut names = HashSet::new();
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token == "*" {
                return OverrideSet::All;
            }
            names.insert(token.to_lowercase());
        }
        OverrideSet::Names(names)
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            OverrideSet::All => true,
            OverrideSet::Names(names) => names.contains(&name.to_lowercase()),
        }
    }
}

/// Operator overrides for keep-alive behavior
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleOverrides {
    pub force_keep_alive: OverrideSet,
    pub disable_keep_alive: OverrideSet,
}

/// Resolve the lifecycle for a server
///
/// Precedence: force-enable override, force-disable override, explicit config,
/// built-in default names, then the stdio command heuristic. Force-enable wins
/// when both override sets match the same name.
pub fn resolve_lifecycle(
    name: &str,
    raw: Option<&RawLifecycle>,
    command: &CommandSpec,
    overrides: &LifecycleOverrides,
) -> Option<ServerLifecycle> {
    if overrides.force_keep_alive.matches(name) {
        return Some(ServerLifecycle::keep_alive());
    }
    if overrides.disable_keep_alive.matches(name) {
        return None;
    }

    if let Some(lifecycle) = raw.and_then(coerce_lifecycle) {
        return Some(lifecycle);
    }

    if DEFAULT_KEEP_ALIVE.contains(&name.to_lowercase().as_str()) {
        return Some(ServerLifecycle::keep_alive());
    }

    if let CommandSpec::Stdio { command, args, .. } = command {
        let expensive = std::iter::once(command)
            .chain(args.iter())
            .map(|token| token.to_lowercase())
            .any(|token| KEEP_ALIVE_COMMAND_FRAGMENTS.iter().any(|frag| token.contains(frag)));
        if expensive {
            return Some(ServerLifecycle::keep_alive());
        }
    }

    None
}

fn coerce_lifecycle(raw: &RawLifecycle) -> Option<ServerLifecycle> {
    let (mode, timeout) = match raw {
        RawLifecycle::Mode(mode) => (mode.as_str(), None),
        RawLifecycle::Detailed { mode, idle_timeout_ms } => (mode.as_str(), *idle_timeout_ms),
    };

    match mode.trim().to_lowercase().as_str() {
        "keep-alive" => Some(ServerLifecycle::KeepAlive {
            idle_timeout: timeout.and_then(coerce_timeout_ms),
        }),
        "ephemeral" => Some(ServerLifecycle::Ephemeral),
        other => {
            tracing::debug!("Ignoring unknown lifecycle mode '{}'", other);
            None
        }
    }
}

/// Finite, positive, truncated to whole milliseconds
fn coerce_timeout_ms(value: f64) -> Option<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = value.trunc() as u64;
    (millis > 0).then(|| Duration::from_millis(millis))
}
