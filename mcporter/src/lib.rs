//! MCP client runtime with keep-alive connections and concurrent discovery

pub mod config;
pub mod mcp;
pub mod output;
