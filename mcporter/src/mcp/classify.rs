//! Failure classification for discovery output
//!
//! Transports rarely hand back structured error codes, so every string and
//! status heuristic lives here behind [`classify`].

use std::time::Duration;

use serde::Serialize;

use super::transport::TransportError;

const AUTH_STATUS_CODES: &[u16] = &[401, 403, 405];

const AUTH_FRAGMENTS: &[&str] = &["unauthorized", "invalid_token", "forbidden"];

const OFFLINE_FRAGMENTS: &[&str] = &[
    "fetch failed",
    "econnrefused",
    "connection refused",
    "connection closed",
    "connection reset",
    "socket hang up",
    "connect timeout",
    "network is unreachable",
    "timed out",
    "timeout",
];

/// Request failures that mean the underlying transport is gone
const CONNECTION_LOST_FRAGMENTS: &[&str] = &[
    "connection closed",
    "connection reset",
    "transport closed",
    "broken pipe",
    "socket hang up",
];

/// Failure category shown in listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Ok,
    Auth,
    Offline,
    Error,
}

/// How a listing row describes a server's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: Category,
    /// Long form for the listing row
    pub display: String,
    /// Short form for summaries
    pub summary: String,
    /// Command that fixes the problem, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Classification {
    pub fn ok(tool_count: usize) -> Self {
        let noun = if tool_count == 1 { "tool" } else { "tools" };
        Self {
            category: Category::Ok,
            display: format!("{} {}", tool_count, noun),
            summary: "ok".to_string(),
            remediation: None,
        }
    }
}

/// Classify a discovery failure
///
/// Auth signals are checked before network signals, so an auth rejection
/// worded like a timeout still reads as auth.
pub fn classify(error: &TransportError, server_name: &str, timeout: Duration) -> Classification {
    let message = error.to_string();
    let lower = message.to_lowercase();

    if is_auth_failure(error, &lower) {
        let command = format!("mcporter auth {}", server_name);
        return Classification {
            category: Category::Auth,
            display: format!("auth required (run '{}')", command),
            summary: "auth required".to_string(),
            remediation: Some(command),
        };
    }

    if OFFLINE_FRAGMENTS.iter().any(|frag| lower.contains(frag)) || matches!(error, TransportError::Timeout(_)) {
        let timed_out = matches!(error, TransportError::Timeout(_)) || lower.contains("timed out") || lower.contains("timeout");
        return if timed_out {
            Classification {
                category: Category::Offline,
                display: format!("timed out after {}s", timeout.as_secs_f64()),
                summary: "timed out".to_string(),
                remediation: None,
            }
        } else {
            Classification {
                category: Category::Offline,
                display: "offline (unable to reach server)".to_string(),
                summary: "offline".to_string(),
                remediation: None,
            }
        };
    }

    let display = if message.trim().is_empty() {
        "unknown error".to_string()
    } else {
        message
    };
    Classification {
        category: Category::Error,
        summary: display.clone(),
        display,
        remediation: None,
    }
}

fn is_auth_failure(error: &TransportError, lower: &str) -> bool {
    if matches!(error, TransportError::Unauthorized(_)) {
        return true;
    }
    if error.status().is_some_and(|status| AUTH_STATUS_CODES.contains(&status)) {
        return true;
    }
    AUTH_STATUS_CODES.iter().any(|code| contains_code(lower, *code))
        || AUTH_FRAGMENTS.iter().any(|frag| lower.contains(frag))
}

/// Whether a failed operation left its connection unusable
///
/// Timeouts and server-side errors don't count; the connection may still
/// answer the next request.
pub fn is_connection_lost(error: &TransportError) -> bool {
    match error {
        TransportError::Connect(message) | TransportError::Request(message) => {
            let lower = message.to_lowercase();
            CONNECTION_LOST_FRAGMENTS.iter().any(|frag| lower.contains(frag))
        }
        _ => false,
    }
}

/// Whole-number match, so "401" does not fire on "14010"
fn contains_code(message: &str, code: u16) -> bool {
    let code = code.to_string();
    message.match_indices(&code).any(|(start, _)| {
        let before = message[..start].chars().next_back();
        let after = message[start + code.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}
