//! Planning pipeline
//!
//! Four-phase pipeline turning a free-text question plus a table schema into
//! a validated, dialect-aware, read-only SQL query: table selection, intent
//! extraction, structured planning, and advisory review. SQL text itself is
//! produced only by the deterministic generator in `sqlgen`.

pub mod intent;
pub mod plan;
pub mod prompts;
pub mod safety;
pub mod sqlgen;
pub mod table_selector;

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::llm::{extract_json_object, ChatMessage, CompletionProvider, GenerateOptions};
use crate::schema::{PlannerSchemaContext, SchemaBundle};
use self::intent::Phase1Result;
use self::plan::QueryPlan;
use self::table_selector::TableSelection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Advisory review of generated SQL. In the primary execution path a
/// rejection triggers re-planning; `corrected_sql` is never executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    #[serde(default)]
    pub corrected_sql: Option<String>,
    pub explanation: String,
}

impl ReviewResult {
    pub fn is_clean(&self) -> bool {
        self.approved && self.issues.is_empty()
    }
}

/// Stateless planning service; one instance serves many chat turns.
#[derive(Clone)]
pub struct PlannerService {
    provider: Arc<dyn CompletionProvider>,
    config: PlannerConfig,
}

impl PlannerService {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: PlannerConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    fn plan_opts(&self) -> GenerateOptions {
        GenerateOptions {
            model: self.config.model.clone(),
            max_tokens: self.config.plan_max_tokens,
        }
    }

    async fn generate_json(&self, prompt: String) -> Result<String> {
        let messages = vec![
            ChatMessage::system("Return JSON only, no text."),
            ChatMessage::user(prompt),
        ];
        self.provider.generate(&messages, &self.plan_opts()).await
    }

    pub async fn select_table(
        &self,
        question: &str,
        bundle: &SchemaBundle,
        guidance: Option<&str>,
    ) -> Result<TableSelection> {
        table_selector::select_best_table(
            self.provider.as_ref(),
            &self.config,
            question,
            bundle,
            guidance,
        )
        .await
    }

    /// Phase 1: infer objective, query type, candidate columns.
    pub async fn phase1(
        &self,
        question: &str,
        ctx: &PlannerSchemaContext,
        guidance: Option<&str>,
    ) -> Result<Phase1Result> {
        let response = self
            .generate_json(prompts::phase1_prompt(question, ctx, guidance))
            .await?;
        let result = Phase1Result::from_response(&response, ctx)?;
        info!(
            query_type = result.intent.query_type.as_str(),
            candidates = result.columns.len(),
            "Phase 1 complete"
        );
        Ok(result)
    }

    /// Phase 2: emit the structured plan. With `execution_error` set, the
    /// prompt carries the failure text and asks for a corrected plan — the
    /// sole repair mechanism; plans are never hand-patched.
    pub async fn phase2(
        &self,
        question: &str,
        ctx: &PlannerSchemaContext,
        phase1: &Phase1Result,
        guidance: Option<&str>,
        execution_error: Option<&str>,
    ) -> Result<QueryPlan> {
        let response = self
            .generate_json(prompts::phase2_prompt(
                question,
                ctx,
                phase1,
                guidance,
                execution_error,
            ))
            .await?;
        let plan = QueryPlan::from_response(&response, ctx)?;
        info!(
            select = plan.select.len(),
            aggregations = plan.aggregations.len(),
            filters = plan.filters.len(),
            "Phase 2 complete"
        );
        Ok(plan)
    }

    /// Phase 3: advisory review of the generated SQL.
    pub async fn review_sql(
        &self,
        question: &str,
        ctx: &PlannerSchemaContext,
        sql: &str,
        guidance: Option<&str>,
    ) -> Result<ReviewResult> {
        let response = self
            .generate_json(prompts::phase3_prompt(question, ctx, sql, guidance))
            .await?;
        let value = extract_json_object(&response)?;

        let issues = value
            .get("issues")
            .and_then(|i| i.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ReviewResult {
            approved: value.get("approved").and_then(|a| a.as_bool()).unwrap_or(false),
            confidence: value
                .get("confidence")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            issues,
            corrected_sql: value
                .get("corrected_sql")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string()),
            explanation: value
                .get("explanation")
                .and_then(|e| e.as_str())
                .unwrap_or("")
                .to_string(),
        })
    }

    /// Final synthesis call: answer strictly from the sampled rows and SQL.
    pub async fn synthesize_answer(
        &self,
        question: &str,
        sql: &str,
        sample_rows_json: &str,
        row_count: usize,
    ) -> Result<String> {
        let messages = vec![
            ChatMessage::system(
                "You are a data analyst. Answer only from the provided rows; never invent values.",
            ),
            ChatMessage::user(prompts::answer_synthesis_prompt(
                question,
                sql,
                sample_rows_json,
                row_count,
            )),
        ];
        let opts = GenerateOptions {
            model: self.config.model.clone(),
            max_tokens: self.config.answer_max_tokens,
        };
        self.provider.generate(&messages, &opts).await
    }
}
