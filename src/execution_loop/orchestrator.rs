//! Chat orchestrator
//!
//! One chat turn is one stateless pass through the state machine:
//! SELECT_TABLE -> PLAN -> VALIDATE_SAFETY -> GENERATE_SQL -> REVIEW ->
//! SANITIZE -> PREFLIGHT -> EXECUTE -> SYNTHESIZE -> PERSIST, with bounded
//! re-planning and a single repair re-run of the whole bracketed sequence.
//! MCP sources are dispatched to a structurally separate handler before any
//! SQL planning begins.

use crate::config::PlannerConfig;
use crate::error::{PlannerError, Result};
use crate::execution_loop::repair::{build_repair_hint, is_transient_execution_error};
use crate::execution_loop::sql_guard::{normalize_sql_for_dialect, sanitize_sql, user_requested_limit};
use crate::mcp_loop;
use crate::planner::intent::QueryType;
use crate::planner::plan::QueryPlan;
use crate::planner::safety::validate_safety;
use crate::planner::sqlgen::{generate_sql, SqlDialect};
use crate::planner::PlannerService;
use crate::runs::{
    ArtifactActions, ChatOutcome, QuerySpecDraft, RunRecord, RunStore, RunType, SourceIdentity,
    TrustPayload,
};
use crate::schema::{build_schema_bundle, SchemaBundle, SchemaCache};
use crate::source::{McpProvider, QueryResult, SourceAdapter, SourceConfig, SourceType};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Inputs for one chat turn. SQL sources need a schema cache and a connected
/// adapter; MCP sources need neither.
pub struct ChatTurnRequest {
    pub question: String,
    pub source: SourceConfig,
    pub schema_cache: Option<SchemaCache>,
    pub adapter: Option<Arc<dyn SourceAdapter>>,
    pub workflow_id: Option<String>,
    pub workflow_run_id: Option<String>,
}

// Mutable observability state threaded through the pipeline so terminal
// failures carry the last attempted SQL and best-available reasoning.
#[derive(Default)]
struct TurnState {
    reasoning: Vec<String>,
    last_sql: Option<String>,
    confidence: Option<f64>,
}

impl TurnState {
    fn note(&mut self, line: impl Into<String>) {
        self.reasoning.push(line.into());
    }

    fn reasoning_text(&self) -> String {
        self.reasoning.join("\n")
    }
}

struct PipelineSuccess {
    sql: String,
    plan: QueryPlan,
    query_type: QueryType,
    result: QueryResult,
}

pub struct ChatOrchestrator {
    planner: PlannerService,
    run_store: Arc<dyn RunStore>,
    mcp_providers: HashMap<String, Arc<dyn McpProvider>>,
}

impl ChatOrchestrator {
    pub fn new(planner: PlannerService, run_store: Arc<dyn RunStore>) -> Self {
        Self {
            planner,
            run_store,
            mcp_providers: HashMap::new(),
        }
    }

    pub fn register_mcp_provider(&mut self, key: impl Into<String>, provider: Arc<dyn McpProvider>) {
        self.mcp_providers.insert(key.into(), provider);
    }

    fn config(&self) -> &PlannerConfig {
        self.planner.config()
    }

    /// Run one chat turn end-to-end.
    pub async fn run_chat_turn(&self, request: ChatTurnRequest) -> Result<ChatOutcome> {
        if request.source.source_type == SourceType::Mcp {
            return self.run_mcp_turn(&request).await;
        }

        let adapter = request.adapter.clone().ok_or_else(|| {
            PlannerError::Execution(format!(
                "Source '{}' requires a connected adapter",
                request.source.name
            ))
        })?;

        let outcome = self.run_sql_turn(&request, adapter.as_ref()).await;

        // Scoped connection: released on every exit path, including failure.
        if let Err(e) = adapter.disconnect().await {
            warn!("Adapter disconnect failed: {}", e);
        }

        outcome
    }

    async fn run_sql_turn(
        &self,
        request: &ChatTurnRequest,
        adapter: &dyn SourceAdapter,
    ) -> Result<ChatOutcome> {
        let source = &request.source;
        let question = request.question.as_str();

        let schema_cache = request.schema_cache.as_ref().ok_or_else(|| {
            PlannerError::NoSchema(format!(
                "Source '{}' has no schema cache; run schema introspection first",
                source.name
            ))
        })?;

        // Schema assembly happens once per turn; NoSchema is fatal.
        let bundle = build_schema_bundle(source, schema_cache, self.config())?;
        let guidance = source.guidance();

        let mut state = TurnState::default();
        let mut repair_hint: Option<String> = None;

        for pipeline_attempt in 1..=self.config().max_pipeline_attempts {
            if pipeline_attempt > 1 {
                state.note(format!("Repair pass {} started", pipeline_attempt));
            }

            let attempt = self
                .plan_and_execute(
                    question,
                    source,
                    &bundle,
                    guidance.as_deref(),
                    repair_hint.as_deref(),
                    adapter,
                    &mut state,
                )
                .await;

            match attempt {
                Ok(success) => {
                    return self.finish_sql_turn(request, success, &mut state).await;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Pipeline attempt {} failed: {}", pipeline_attempt, e);
                    state.note(format!("Attempt {} failed: {}", pipeline_attempt, e));
                    if pipeline_attempt == self.config().max_pipeline_attempts {
                        return Err(self.terminal_failure(request, e, &state).await);
                    }
                    repair_hint = Some(build_repair_hint(&e.to_string(), state.last_sql.as_deref()));
                }
            }
        }

        unreachable!("pipeline loop always returns within the attempt bound")
    }

    /// One pass of the bracketed SELECT_TABLE..EXECUTE sequence.
    #[allow(clippy::too_many_arguments)]
    async fn plan_and_execute(
        &self,
        question: &str,
        source: &SourceConfig,
        bundle: &SchemaBundle,
        guidance: Option<&str>,
        repair_hint: Option<&str>,
        adapter: &dyn SourceAdapter,
        state: &mut TurnState,
    ) -> Result<PipelineSuccess> {
        let selection = self.planner.select_table(question, bundle, guidance).await?;
        state.note(format!(
            "Selected table '{}': {}",
            selection.table_name, selection.reasoning
        ));
        state.confidence = selection.confidence;

        let ctx = bundle.context_for(source, &selection.table_name)?;
        let dialect = SqlDialect::for_source(source.source_type);

        let phase1 = self.planner.phase1(question, &ctx, guidance).await?;
        state.note(format!(
            "Intent: {} ({})",
            phase1.intent.objective,
            phase1.intent.query_type.as_str()
        ));

        let honor_limit = user_requested_limit(question);
        let mut plan_feedback: Option<String> = repair_hint.map(|h| h.to_string());
        let mut safety_retry_used = false;
        let mut review_retry_used = false;

        let (sql, plan) = loop {
            let mut plan = self
                .planner
                .phase2(question, &ctx, &phase1, guidance, plan_feedback.as_deref())
                .await?;

            // The model may not silently truncate results the user did not
            // ask to truncate.
            if !honor_limit && plan.limit.is_some() {
                info!("Dropping model-proposed limit; user did not request one");
                plan.limit = None;
            }

            let safety = validate_safety(&ctx, &plan);
            for warning in &safety.warnings {
                state.note(format!("Safety warning: {}", warning));
            }

            if safety.is_blocking() {
                if !safety_retry_used {
                    safety_retry_used = true;
                    plan_feedback = Some(format!(
                        "The previous plan had structural defects. Fix all of them:\n{}",
                        safety.issues.join("\n")
                    ));
                    continue;
                }
                return Err(PlannerError::Execution(format!(
                    "Plan failed safety validation: {}",
                    safety.issues.join("; ")
                )));
            }

            let sql = generate_sql(&ctx, &plan, &safety);
            state.last_sql = Some(sql.clone());

            let review = self.planner.review_sql(question, &ctx, &sql, guidance).await?;
            state.confidence = Some(review.confidence);

            if review.is_clean() {
                state.note(format!("Review approved SQL: {}", review.explanation));
                break (sql, plan);
            }

            state.note(format!(
                "Review rejected SQL ({}): {}",
                review.issues.join("; "),
                review.explanation
            ));
            if review.corrected_sql.is_some() {
                // Reviewer-authored SQL is never executed.
                state.note("Reviewer proposed corrected SQL; discarded in favor of re-planning".to_string());
            }

            if !review_retry_used {
                review_retry_used = true;
                plan_feedback = Some(format!(
                    "A reviewer rejected the generated SQL for these reasons:\n{}\nExplanation: {}",
                    review.issues.join("\n"),
                    review.explanation
                ));
                continue;
            }

            // Review is advisory; after the bounded re-plan the pipeline
            // proceeds and lets preflight/execution arbitrate.
            warn!("Review still rejecting after re-plan; proceeding to execution");
            break (sql, plan);
        };

        let sanitized = sanitize_sql(&sql)?;
        let normalized = normalize_sql_for_dialect(&sanitized, dialect);
        state.last_sql = Some(normalized.clone());

        self.preflight(&normalized, adapter, state).await?;
        let result = self.execute_with_retry(&normalized, adapter).await?;

        info!(rows = result.row_count, "Query executed");
        Ok(PipelineSuccess {
            sql: normalized,
            plan,
            query_type: phase1.intent.query_type,
            result,
        })
    }

    /// Compile-only probe: surfaces syntax/semantic rejections before the
    /// real query counts as an attempt.
    async fn preflight(
        &self,
        sql: &str,
        adapter: &dyn SourceAdapter,
        state: &mut TurnState,
    ) -> Result<()> {
        let probe = format!("SELECT * FROM ({}) AS __preflight LIMIT 0", sql);
        match adapter.execute_query(&probe).await {
            Ok(_) => Ok(()),
            Err(e) => {
                state.note(format!("Preflight rejected SQL: {}", e));
                Err(PlannerError::Preflight(e.to_string()))
            }
        }
    }

    async fn execute_with_retry(
        &self,
        sql: &str,
        adapter: &dyn SourceAdapter,
    ) -> Result<QueryResult> {
        let mut retries_used: u8 = 0;
        loop {
            match adapter.execute_query(sql).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let message = e.to_string();
                    if retries_used < self.config().max_execution_attempts
                        && is_transient_execution_error(&message)
                    {
                        retries_used += 1;
                        let backoff = self.config().backoff_step_ms * retries_used as u64;
                        warn!(
                            "Transient execution failure (retry {} in {} ms): {}",
                            retries_used, backoff, message
                        );
                        sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }
                    return Err(PlannerError::Execution(message));
                }
            }
        }
    }

    async fn finish_sql_turn(
        &self,
        request: &ChatTurnRequest,
        success: PipelineSuccess,
        state: &mut TurnState,
    ) -> Result<ChatOutcome> {
        let source = &request.source;
        let sample: Vec<_> = success
            .result
            .rows
            .iter()
            .take(self.config().sample_row_limit)
            .cloned()
            .collect();
        let sample_json = serde_json::to_string_pretty(&sample)?;

        let answer = self
            .planner
            .synthesize_answer(
                &request.question,
                &success.sql,
                &sample_json,
                success.result.row_count,
            )
            .await?;

        let confidence = state.confidence.unwrap_or(0.5).clamp(0.0, 1.0);

        self.run_store
            .create_run(RunRecord {
                message: request.question.clone(),
                sql_text: Some(success.sql.clone()),
                row_count: Some(success.result.row_count),
                confidence: Some(confidence),
                reasoning: state.reasoning_text(),
                answer: Some(answer.clone()),
                result_sample: sample.clone(),
                run_type: RunType::Chat,
                workflow_id: request.workflow_id.clone(),
                workflow_run_id: request.workflow_run_id.clone(),
                created_at: Utc::now(),
            })
            .await?;

        let metadata_json = serde_json::json!({
            "queryType": success.query_type.as_str(),
            "rationale": success.plan.rationale,
            "limit": success.plan.limit,
        });

        Ok(ChatOutcome {
            answer,
            source: SourceIdentity {
                id: source.id.clone(),
                name: source.name.clone(),
                source_type: source.source_type,
            },
            artifact_actions: ArtifactActions::for_sql_result(),
            query_spec_draft: Some(QuerySpecDraft {
                name: draft_name(&request.question),
                source_id: source.id.clone(),
                sql_text: success.sql.clone(),
                metadata_json,
            }),
            trust: TrustPayload {
                sql: Some(success.sql),
                row_count: success.result.row_count,
                sample_rows: sample,
                model: self.config().model.clone(),
                reasoning: state.reasoning_text(),
                confidence,
            },
        })
    }

    /// Persist a failure record, then surface the structured terminal error.
    async fn terminal_failure(
        &self,
        request: &ChatTurnRequest,
        error: PlannerError,
        state: &TurnState,
    ) -> PlannerError {
        let record = RunRecord {
            message: request.question.clone(),
            sql_text: state.last_sql.clone(),
            row_count: None,
            confidence: state.confidence,
            reasoning: state.reasoning_text(),
            answer: None,
            result_sample: vec![],
            run_type: RunType::Chat,
            workflow_id: request.workflow_id.clone(),
            workflow_run_id: request.workflow_run_id.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.run_store.create_run(record).await {
            warn!("Failed to persist failure run record: {}", e);
        }

        PlannerError::ChatFailed {
            message: error.to_string(),
            sql: state.last_sql.clone(),
            source_id: request.source.id.clone(),
            source_name: request.source.name.clone(),
            reasoning: state.reasoning_text(),
            confidence: state.confidence,
        }
    }

    /// MCP sources never touch the SQL planner.
    async fn run_mcp_turn(&self, request: &ChatTurnRequest) -> Result<ChatOutcome> {
        let source = &request.source;
        let provider_key = source.mcp_provider.as_deref().unwrap_or("");
        let mcp = self
            .mcp_providers
            .get(provider_key)
            .cloned()
            .ok_or_else(|| PlannerError::UnsupportedProvider(provider_key.to_string()))?;

        let loop_result =
            mcp_loop::run_tool_loop(&self.planner, mcp.as_ref(), source, &request.question).await?;

        self.run_store
            .create_run(RunRecord {
                message: request.question.clone(),
                sql_text: None,
                row_count: None,
                confidence: None,
                reasoning: loop_result.reasoning.join("\n"),
                answer: Some(loop_result.answer.clone()),
                result_sample: vec![],
                run_type: RunType::Mcp,
                workflow_id: request.workflow_id.clone(),
                workflow_run_id: request.workflow_run_id.clone(),
                created_at: Utc::now(),
            })
            .await?;

        Ok(ChatOutcome {
            answer: loop_result.answer,
            source: SourceIdentity {
                id: source.id.clone(),
                name: source.name.clone(),
                source_type: source.source_type,
            },
            artifact_actions: ArtifactActions::none(),
            query_spec_draft: None,
            trust: TrustPayload {
                sql: None,
                row_count: 0,
                sample_rows: vec![],
                model: self.config().model.clone(),
                reasoning: loop_result.reasoning.join("\n"),
                confidence: 0.5,
            },
        })
    }
}

fn draft_name(question: &str) -> String {
    let trimmed = question.trim();
    if trimmed.len() <= 60 {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .nth(57)
            .map(|(idx, _)| idx)
            .unwrap_or(trimmed.len());
        format!("{}...", &trimmed[..cut])
    }
}
