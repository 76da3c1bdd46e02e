//! Run history and chat outcomes
//!
//! The narrow "record a run" interface the pipeline writes through, and the
//! JSON-serializable result shape consumed by the UI/API layer.

use crate::error::{PlannerError, Result};
use crate::source::SourceType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Chat,
    Mcp,
}

/// Append-only record of one chat turn, persisted on success and on
/// terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub message: String,
    pub sql_text: Option<String>,
    pub row_count: Option<usize>,
    pub confidence: Option<f64>,
    pub reasoning: String,
    pub answer: Option<String>,
    pub result_sample: Vec<HashMap<String, serde_json::Value>>,
    pub run_type: RunType,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a run record, returning its id.
    async fn create_run(&self, record: RunRecord) -> Result<String>;
}

/// In-memory store used by tests and the demo binary.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<Vec<(String, RunRecord)>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, RunRecord)> {
        self.runs
            .lock()
            .map(|runs| runs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, record: RunRecord) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| PlannerError::RunStore("Run store mutex poisoned".to_string()))?;
        runs.push((run_id.clone(), record));
        Ok(run_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
}

/// Which artifact actions the UI may offer for this outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactActions {
    pub can_save_table: bool,
    pub can_create_chart: bool,
    pub can_create_kpi: bool,
    pub can_add_to_dashboard: bool,
    pub can_save_sql: bool,
}

impl ArtifactActions {
    pub fn for_sql_result() -> Self {
        Self {
            can_save_table: true,
            can_create_chart: true,
            can_create_kpi: true,
            can_add_to_dashboard: true,
            can_save_sql: true,
        }
    }

    pub fn none() -> Self {
        Self {
            can_save_table: false,
            can_create_chart: false,
            can_create_kpi: false,
            can_add_to_dashboard: false,
            can_save_sql: false,
        }
    }
}

/// Draft query spec the user can save as an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpecDraft {
    pub name: String,
    pub source_id: String,
    pub sql_text: String,
    pub metadata_json: serde_json::Value,
}

/// Observability payload attached to every successful answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustPayload {
    pub sql: Option<String>,
    pub row_count: usize,
    pub sample_rows: Vec<HashMap<String, serde_json::Value>>,
    pub model: String,
    pub reasoning: String,
    pub confidence: f64,
}

/// Terminal success shape for one chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub answer: String,
    pub source: SourceIdentity,
    pub artifact_actions: ArtifactActions,
    pub query_spec_draft: Option<QuerySpecDraft>,
    pub trust: TrustPayload,
}
