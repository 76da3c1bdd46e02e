//! Planner configuration
//!
//! Bounds and model settings for the planning pipeline, read once from the
//! environment at startup.

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Model identifier passed to the completion provider.
    pub model: String,

    /// Base URL of the OpenAI-compatible endpoint.
    pub base_url: String,

    /// API key for the completion provider.
    pub api_key: String,

    /// Token budget for planning calls (table selection, phases 1-3).
    pub plan_max_tokens: u32,

    /// Token budget for the final answer synthesis call.
    pub answer_max_tokens: u32,

    /// In-place execution retries for transient failures.
    pub max_execution_attempts: u8,

    /// Whole-pipeline passes: initial run plus one repair re-run.
    pub max_pipeline_attempts: u8,

    /// Linear backoff step between execution retries, in milliseconds.
    pub backoff_step_ms: u64,

    /// Rows handed to answer synthesis and persisted as the result sample.
    pub sample_row_limit: usize,

    /// Tables included in the textual schema summary.
    pub schema_table_cap: usize,

    /// Columns previewed per table in the textual schema summary.
    pub schema_column_preview_cap: usize,

    /// Sequential tool rounds allowed in the MCP loop.
    pub mcp_max_rounds: u8,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            plan_max_tokens: 1200,
            answer_max_tokens: 800,
            max_execution_attempts: 2,
            max_pipeline_attempts: 2,
            backoff_step_ms: 400,
            sample_row_limit: 50,
            schema_table_cap: 80,
            schema_column_preview_cap: 30,
            mcp_max_rounds: 8,
        }
    }
}

impl PlannerConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Recognized variables: OPENAI_API_KEY, OPENAI_BASE_URL, PLANNER_MODEL.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.api_key = key;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("PLANNER_MODEL") {
            config.model = model;
        }
        config
    }
}
