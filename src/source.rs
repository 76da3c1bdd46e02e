//! Source capabilities
//!
//! Configured connections to external queryable systems, and the adapter
//! traits the orchestrator drives. Concrete drivers live outside this crate;
//! the planner only ever sees these contracts.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Postgres,
    BigQuery,
    /// Google Sheets surfaced through BigQuery external tables.
    SheetsBigQuery,
    Mcp,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Postgres => "postgres",
            SourceType::BigQuery => "bigquery",
            SourceType::SheetsBigQuery => "sheets_bigquery",
            SourceType::Mcp => "mcp",
        }
    }
}

/// Configuration snapshot for one source, read-only for the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,

    /// Fully-qualified `project.dataset.table` override for sheets-backed
    /// warehouse tables.
    #[serde(default)]
    pub sheets_qualified_table: Option<String>,

    /// Free-text notes entered by the user about this source.
    #[serde(default)]
    pub user_notes: Option<String>,

    /// Notes inferred by prior introspection runs.
    #[serde(default)]
    pub inferred_notes: Option<String>,

    /// Memory rules that must be threaded into every planning prompt.
    #[serde(default)]
    pub memory_rules: Vec<String>,

    /// Registered MCP provider key, for `SourceType::Mcp` sources.
    #[serde(default)]
    pub mcp_provider: Option<String>,

    /// Server name passed through to MCP action execution.
    #[serde(default)]
    pub mcp_server_name: Option<String>,
}

impl SourceConfig {
    /// Concatenate notes and memory rules into prompt guidance.
    pub fn guidance(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(ref notes) = self.user_notes {
            if !notes.trim().is_empty() {
                parts.push(format!("User notes: {}", notes.trim()));
            }
        }
        if let Some(ref notes) = self.inferred_notes {
            if !notes.trim().is_empty() {
                parts.push(format!("Inferred notes: {}", notes.trim()));
            }
        }
        for rule in &self.memory_rules {
            if !rule.trim().is_empty() {
                parts.push(format!("Rule: {}", rule.trim()));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

/// Rows returned by an adapter. Row shape is opaque; columns vary per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub row_count: usize,
}

/// Adapter capability: connected on construction, executes raw read-only SQL,
/// released once per chat turn.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn execute_query(&self, sql: &str) -> Result<QueryResult>;

    async fn disconnect(&self) -> Result<()>;
}

/// A named action exposed by an MCP tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    pub description: String,
}

/// MCP capability: enumerate named actions and execute one by name.
#[async_trait]
pub trait McpProvider: Send + Sync {
    async fn list_tools(&self, server_name: &str) -> Result<Vec<McpTool>>;

    async fn execute_action(
        &self,
        server_name: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value>;
}
