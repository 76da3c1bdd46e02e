use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("No usable schema: {0}")]
    NoSchema(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("SQL sanitization rejected statement: {0}")]
    SqlSanitization(String),

    #[error("Preflight rejected statement: {0}")]
    Preflight(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Unsupported MCP provider: {0}")]
    UnsupportedProvider(String),

    #[error("Run store error: {0}")]
    RunStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Terminal failure surfaced to the caller with full context attached.
    #[error("Chat turn failed for source '{source_name}': {message}")]
    ChatFailed {
        message: String,
        sql: Option<String>,
        source_id: String,
        source_name: String,
        reasoning: String,
        confidence: Option<f64>,
    },
}

impl PlannerError {
    /// Fatal errors end the turn immediately; everything else is eligible
    /// for one repair cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlannerError::NoSchema(_)
                | PlannerError::UnsupportedProvider(_)
                | PlannerError::ChatFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PlannerError>;
