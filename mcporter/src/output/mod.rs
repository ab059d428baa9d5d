//! Listing output
//!
//! Turns discovery outcomes into rows (name, description, tool count or
//! classified failure, duration, source) and renders them as plain text or
//! JSON. Rendering is pure so the CLI stays a thin shell around it.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::mcp::{classify, Category, Classification, ListOutcome, ListStatus, ServerSource, ToolInfo};

// ============================================================================
// Rows
// ============================================================================

/// One server's line in a listing
#[derive(Debug, Clone, Serialize)]
pub struct ListRow {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
    pub classification: Classification,
    pub duration_ms: u128,
    /// Set for servers that came from an imported config file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ListRow {
    pub fn from_outcome(outcome: &ListOutcome, timeout: Duration) -> Self {
        let definition = &outcome.definition;
        let (classification, tool_count) = match &outcome.status {
            ListStatus::Ok { tools } => (Classification::ok(tools.len()), Some(tools.len())),
            ListStatus::Error { error } => (classify(error, &definition.name, timeout), None),
        };
        let source = match &definition.source {
            ServerSource::Import { path } => Some(path.display().to_string()),
            ServerSource::Local { .. } => None,
        };

        Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            status: classification.category,
            tool_count,
            classification,
            duration_ms: outcome.duration.as_millis(),
            source,
        }
    }
}

/// Rows in the same order as the outcomes
pub fn list_rows(outcomes: &[ListOutcome], timeout: Duration) -> Vec<ListRow> {
    outcomes.iter().map(|o| ListRow::from_outcome(o, timeout)).collect()
}

// ============================================================================
// Text rendering
// ============================================================================

/// Render rows as text, one server per line, with a summary footer
pub fn render_rows(rows: &[ListRow]) -> String {
    let mut out = String::new();
    if rows.is_empty() {
        out.push_str("No MCP servers configured.\n");
        return out;
    }

    for row in rows {
        let _ = write!(out, "- {}", row.name);
        if let Some(description) = &row.description {
            let _ = write!(out, ": {}", first_line(description));
        }
        let _ = write!(out, " ({}, {}ms)", row.classification.display, row.duration_ms);
        if let Some(source) = &row.source {
            let _ = write!(out, " [from {}]", source);
        }
        out.push('\n');
    }

    let count = |category: Category| rows.iter().filter(|r| r.status == category).count();
    let _ = writeln!(
        out,
        "\n{} server(s): {} ok, {} auth required, {} offline, {} error",
        rows.len(),
        count(Category::Ok),
        count(Category::Auth),
        count(Category::Offline),
        count(Category::Error)
    );
    out
}

/// Render one server's tools, optionally with input schemas
pub fn render_tools(server: &str, tools: &[ToolInfo], with_schema: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {} ({} tools) ===", server, tools.len());
    for tool in tools {
        let desc = tool.description.as_deref().map(first_line).unwrap_or("No description");
        let _ = writeln!(out, "  {} - {}", tool.name, desc);
        if with_schema {
            if let Some(schema) = &tool.input_schema {
                let pretty = serde_json::to_string_pretty(schema).unwrap_or_default();
                for line in pretty.lines() {
                    let _ = writeln!(out, "      {}", line);
                }
            }
        }
    }
    out
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{CommandSpec, ServerDefinition, TransportError};
    use std::path::PathBuf;

    fn outcome(name: &str, status: ListStatus) -> ListOutcome {
        ListOutcome {
            definition: ServerDefinition::new(
                name,
                CommandSpec::Http {
                    url: "https://example.com/mcp".to_string(),
                },
                ServerSource::Local {
                    path: PathBuf::from("mcporter.json"),
                },
            ),
            status,
            duration: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_rows_and_render() {
        let mut imported = outcome(
            "linear",
            ListStatus::Error {
                error: TransportError::Http {
                    status: 401,
                    message: "Unauthorized".to_string(),
                },
            },
        );
        imported.definition.source = ServerSource::Import {
            path: PathBuf::from("/home/u/.cursor/mcp.json"),
        };
        let outcomes = vec![
            outcome(
                "docs",
                ListStatus::Ok {
                    tools: vec![ToolInfo::new("search"), ToolInfo::new("fetch")],
                },
            ),
            imported,
        ];

        let rows = list_rows(&outcomes, Duration::from_secs(30));
        assert_eq!(rows[0].tool_count, Some(2));
        assert_eq!(rows[0].status, Category::Ok);
        assert_eq!(rows[1].status, Category::Auth);
        assert_eq!(rows[1].source.as_deref(), Some("/home/u/.cursor/mcp.json"));

        let text = render_rows(&rows);
        assert!(text.contains("- docs (2 tools, 42ms)"));
        assert!(text.contains("mcporter auth linear"));
        assert!(text.contains("[from /home/u/.cursor/mcp.json]"));
        assert!(text.contains("2 server(s): 1 ok, 1 auth required, 0 offline, 0 error"));
    }

    #[test]
    fn test_row_json_shape() {
        let rows = list_rows(
            &[outcome(
                "docs",
                ListStatus::Ok {
                    tools: vec![ToolInfo::new("search")],
                },
            )],
            Duration::from_secs(30),
        );
        let json = serde_json::to_value(&rows).unwrap();
        assert_eq!(json[0]["name"], "docs");
        assert_eq!(json[0]["status"], "ok");
        assert_eq!(json[0]["tool_count"], 1);
        assert!(json[0].get("source").is_none());
    }

    #[test]
    fn test_render_tools() {
        let mut tool = ToolInfo::new("search");
        tool.description = Some("Search docs\nwith more detail".to_string());
        tool.input_schema = Some(serde_json::json!({"type": "object"}));

        let text = render_tools("docs", &[tool], true);
        assert!(text.starts_with("=== docs (1 tools) ==="));
        assert!(text.contains("  search - Search docs\n"));
        assert!(text.contains("\"type\": \"object\""));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_rows(&[]), "No MCP servers configured.\n");
    }
}
