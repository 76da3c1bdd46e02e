//! End-to-end pipeline tests
//!
//! Drive the orchestrator with scripted completion providers and mock
//! adapters: success path, limit heuristics, review-triggered re-planning,
//! transient retries, the single repair pass, and the MCP loop.

use async_trait::async_trait;
use queryweaver::config::PlannerConfig;
use queryweaver::error::{PlannerError, Result};
use queryweaver::execution_loop::{ChatOrchestrator, ChatTurnRequest};
use queryweaver::llm::{ChatMessage, CompletionProvider, GenerateOptions, LlmReply, ToolCall, ToolDefinition};
use queryweaver::planner::PlannerService;
use queryweaver::runs::{InMemoryRunStore, RunType};
use queryweaver::schema::{SchemaCache, SchemaColumn, SchemaTable};
use queryweaver::source::{McpProvider, McpTool, QueryResult, SourceAdapter, SourceConfig, SourceType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn orders_schema() -> SchemaCache {
    SchemaCache {
        tables: vec![SchemaTable {
            name: "orders".to_string(),
            columns: vec![
                SchemaColumn { name: "id".to_string(), column_type: "bigint".to_string(), nullable: Some(false) },
                SchemaColumn { name: "customer".to_string(), column_type: "text".to_string(), nullable: Some(false) },
                SchemaColumn { name: "amount".to_string(), column_type: "numeric".to_string(), nullable: Some(false) },
                SchemaColumn { name: "created_at".to_string(), column_type: "timestamp".to_string(), nullable: Some(false) },
            ],
        }],
    }
}

fn postgres_source() -> SourceConfig {
    SourceConfig {
        id: "src-1".to_string(),
        name: "warehouse".to_string(),
        source_type: SourceType::Postgres,
        sheets_qualified_table: None,
        user_notes: None,
        inferred_notes: None,
        memory_rules: vec![],
        mcp_provider: None,
        mcp_server_name: None,
    }
}

fn test_config() -> PlannerConfig {
    let mut config = PlannerConfig::default();
    // Keep retries fast in tests.
    config.backoff_step_ms = 1;
    config
}

/// Scripted completion provider. Dispatches on prompt markers and records
/// every prompt for assertions; review rejections are configurable.
struct ScriptedProvider {
    prompts: Mutex<Vec<String>>,
    reviews_to_reject: AtomicUsize,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            reviews_to_reject: AtomicUsize::new(0),
        }
    }

    fn rejecting_reviews(count: usize) -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            reviews_to_reject: AtomicUsize::new(count),
        }
    }

    fn prompts_matching(&self, marker: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(marker))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn generate(&self, messages: &[ChatMessage], _opts: &GenerateOptions) -> Result<String> {
        let prompt = messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt.clone());

        if prompt.contains("Pick the single best table") {
            return Ok(r#"{"table":"orders","reasoning":"has revenue","confidence":0.9}"#.to_string());
        }
        if prompt.contains("which columns matter") {
            return Ok(r#"{
                "objective": "total revenue by customer",
                "entities": ["customer"],
                "metrics": ["revenue"],
                "dimensions": ["customer"],
                "query_type": "aggregation",
                "columns": [
                    {"column": "customer", "usage": "group", "reason": "key", "confidence": 0.9},
                    {"column": "amount", "usage": "aggregate", "reason": "metric", "confidence": 0.9}
                ]
            }"#
            .to_string());
        }
        if prompt.contains("Build a structured query plan") {
            // The plan always proposes a limit; the orchestrator decides
            // whether the user actually asked for one.
            return Ok(r#"{
                "select": ["customer"],
                "filters": [],
                "aggregations": [{"function": "SUM", "column": "amount", "alias": "total_revenue"}],
                "group_by": ["customer"],
                "order_by": [{"column": "total_revenue", "direction": "DESC"}],
                "window": null,
                "limit": 5,
                "rationale": "group and sum"
            }"#
            .to_string());
        }
        if prompt.contains("Review the generated SQL") {
            let remaining = self.reviews_to_reject.load(Ordering::SeqCst);
            if remaining > 0 {
                self.reviews_to_reject.store(remaining - 1, Ordering::SeqCst);
                return Ok(r#"{"approved":false,"confidence":0.3,"issues":["ordering looks wrong"],"corrected_sql":"SELECT 1","explanation":"needs a re-plan"}"#.to_string());
            }
            return Ok(r#"{"approved":true,"confidence":0.9,"issues":[],"corrected_sql":null,"explanation":"looks right"}"#.to_string());
        }
        if prompt.contains("Answer the user's question strictly") {
            return Ok("Acme Corp has the highest total revenue.".to_string());
        }
        Err(PlannerError::Llm(format!("No scripted response for prompt: {}", prompt)))
    }

    async fn generate_with_tools(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _opts: &GenerateOptions,
    ) -> Result<LlmReply> {
        Err(PlannerError::Llm("Tools not scripted in this provider".to_string()))
    }
}

/// Adapter that succeeds, optionally after a scripted number of failures on
/// real (non-preflight) executions.
struct MockAdapter {
    failures_remaining: Mutex<usize>,
    failure_message: String,
    real_calls: AtomicUsize,
    preflight_calls: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockAdapter {
    fn healthy() -> Self {
        Self::failing(0, "")
    }

    fn failing(failures: usize, message: &str) -> Self {
        Self {
            failures_remaining: Mutex::new(failures),
            failure_message: message.to_string(),
            real_calls: AtomicUsize::new(0),
            preflight_calls: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        if sql.contains("__preflight") {
            self.preflight_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(QueryResult { rows: vec![], row_count: 0 });
        }
        self.real_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PlannerError::Execution(self.failure_message.clone()));
            }
        }
        let rows = vec![
            HashMap::from([
                ("customer".to_string(), serde_json::json!("Acme Corp")),
                ("total_revenue".to_string(), serde_json::json!(48250.0)),
            ]),
            HashMap::from([
                ("customer".to_string(), serde_json::json!("Globex")),
                ("total_revenue".to_string(), serde_json::json!(31900.5)),
            ]),
        ];
        let row_count = rows.len();
        Ok(QueryResult { rows, row_count })
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn orchestrator_with(provider: Arc<ScriptedProvider>) -> (ChatOrchestrator, Arc<InMemoryRunStore>) {
    let planner = PlannerService::new(provider, test_config());
    let run_store = Arc::new(InMemoryRunStore::new());
    (ChatOrchestrator::new(planner, run_store.clone()), run_store)
}

fn request(question: &str, adapter: Arc<dyn SourceAdapter>) -> ChatTurnRequest {
    ChatTurnRequest {
        question: question.to_string(),
        source: postgres_source(),
        schema_cache: Some(orders_schema()),
        adapter: Some(adapter),
        workflow_id: None,
        workflow_run_id: None,
    }
}

#[tokio::test]
async fn test_end_to_end_revenue_by_customer() {
    let provider = Arc::new(ScriptedProvider::new());
    let (orchestrator, run_store) = orchestrator_with(provider.clone());
    let adapter = Arc::new(MockAdapter::healthy());

    let outcome = orchestrator
        .run_chat_turn(request("what is total revenue by customer", adapter.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.answer, "Acme Corp has the highest total revenue.");
    let sql = outcome.trust.sql.as_deref().unwrap();
    assert!(sql.contains("SUM(\"amount\") AS \"total_revenue\""));
    assert!(sql.contains("FROM \"orders\""));
    assert!(sql.contains("GROUP BY \"customer\""));
    // No limit language in the question: the plan's proposed limit is nulled.
    assert!(!sql.contains("LIMIT"));
    assert_eq!(outcome.trust.row_count, 2);
    assert!(outcome.artifact_actions.can_save_sql);
    assert!(outcome.query_spec_draft.is_some());

    // One preflight probe, one real execution, one scoped disconnect.
    assert_eq!(adapter.preflight_calls.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.real_calls.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.disconnects.load(Ordering::SeqCst), 1);

    let records = run_store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.run_type, RunType::Chat);
    assert_eq!(records[0].1.row_count, Some(2));
    assert!(records[0].1.answer.is_some());
}

#[tokio::test]
async fn test_user_requested_limit_is_honored() {
    let provider = Arc::new(ScriptedProvider::new());
    let (orchestrator, _) = orchestrator_with(provider);
    let adapter = Arc::new(MockAdapter::healthy());

    let outcome = orchestrator
        .run_chat_turn(request("show me top 5 customers by revenue", adapter))
        .await
        .unwrap();

    let sql = outcome.trust.sql.as_deref().unwrap();
    assert!(sql.contains("LIMIT 5"));
}

#[tokio::test]
async fn test_review_rejection_triggers_replan_not_patching() {
    let provider = Arc::new(ScriptedProvider::rejecting_reviews(1));
    let (orchestrator, _) = orchestrator_with(provider.clone());
    let adapter = Arc::new(MockAdapter::healthy());

    let outcome = orchestrator
        .run_chat_turn(request("what is total revenue by customer", adapter))
        .await
        .unwrap();

    // Two Phase-2 calls: initial plan plus the review-triggered re-plan.
    let phase2_prompts = provider.prompts_matching("Build a structured query plan");
    assert_eq!(phase2_prompts.len(), 2);
    assert!(phase2_prompts[1].contains("reviewer rejected"));

    // The reviewer's corrected SQL is never executed.
    assert_ne!(outcome.trust.sql.as_deref(), Some("SELECT 1"));
    assert!(outcome.trust.reasoning.contains("discarded in favor of re-planning"));
}

#[tokio::test]
async fn test_transient_failures_retried_in_place() {
    let provider = Arc::new(ScriptedProvider::new());
    let (orchestrator, _) = orchestrator_with(provider.clone());
    let adapter = Arc::new(MockAdapter::failing(2, "HTTP 503 Service Unavailable"));

    let outcome = orchestrator
        .run_chat_turn(request("what is total revenue by customer", adapter.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.trust.row_count, 2);
    // Initial execution plus two in-place retries, all in one pipeline pass.
    assert_eq!(adapter.real_calls.load(Ordering::SeqCst), 3);
    assert_eq!(provider.prompts_matching("Build a structured query plan").len(), 1);
}

#[tokio::test]
async fn test_hard_failure_takes_one_repair_pass() {
    let provider = Arc::new(ScriptedProvider::new());
    let (orchestrator, run_store) = orchestrator_with(provider.clone());
    let adapter = Arc::new(MockAdapter::failing(1, "column \"ghost\" does not exist"));

    let outcome = orchestrator
        .run_chat_turn(request("what is total revenue by customer", adapter.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.trust.row_count, 2);
    // Non-transient failure: no in-place retry, one whole-pipeline repair.
    assert_eq!(adapter.real_calls.load(Ordering::SeqCst), 2);
    let phase2_prompts = provider.prompts_matching("Build a structured query plan");
    assert_eq!(phase2_prompts.len(), 2);
    assert!(phase2_prompts[1].contains("Execution failed with"));
    assert!(phase2_prompts[1].contains("ghost"));
    assert_eq!(run_store.records().len(), 1);
}

#[tokio::test]
async fn test_persistent_failure_is_terminal_with_context() {
    let provider = Arc::new(ScriptedProvider::new());
    let (orchestrator, run_store) = orchestrator_with(provider);
    let adapter = Arc::new(MockAdapter::failing(10, "syntax error at or near FROM"));

    let err = orchestrator
        .run_chat_turn(request("what is total revenue by customer", adapter.clone()))
        .await
        .unwrap_err();

    match err {
        PlannerError::ChatFailed { sql, source_id, source_name, reasoning, .. } => {
            assert!(sql.is_some());
            assert_eq!(source_id, "src-1");
            assert_eq!(source_name, "warehouse");
            assert!(reasoning.contains("failed"));
        }
        other => panic!("Expected ChatFailed, got {:?}", other),
    }

    // Failure run record persisted; adapter still released.
    assert_eq!(run_store.records().len(), 1);
    assert!(run_store.records()[0].1.answer.is_none());
    assert_eq!(adapter.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_schema_is_fatal_without_retry() {
    let provider = Arc::new(ScriptedProvider::new());
    let (orchestrator, run_store) = orchestrator_with(provider.clone());
    let adapter = Arc::new(MockAdapter::healthy());

    let mut req = request("anything", adapter);
    req.schema_cache = Some(SchemaCache { tables: vec![] });

    let err = orchestrator.run_chat_turn(req).await.unwrap_err();
    assert!(matches!(err, PlannerError::NoSchema(_)));
    // Fatal before any completion call.
    assert!(provider.prompts.lock().unwrap().is_empty());
    assert!(run_store.records().is_empty());
}

// ---------------------------------------------------------------------------
// MCP path

struct McpScriptedProvider {
    tool_rounds: AtomicUsize,
}

#[async_trait]
impl CompletionProvider for McpScriptedProvider {
    async fn generate(&self, _messages: &[ChatMessage], _opts: &GenerateOptions) -> Result<String> {
        Err(PlannerError::Llm("MCP test never calls plain generate".to_string()))
    }

    async fn generate_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        _opts: &GenerateOptions,
    ) -> Result<LlmReply> {
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "execute_action");

        let round = self.tool_rounds.fetch_add(1, Ordering::SeqCst);
        if round == 0 {
            return Ok(LlmReply::ToolCalls {
                calls: vec![ToolCall {
                    id: "call-1".to_string(),
                    name: "execute_action".to_string(),
                    input: serde_json::json!({"action": "list_tickets", "params": {"status": "open"}}),
                }],
                text: None,
            });
        }

        // The tool result must have been fed back as a tool message.
        assert!(messages.iter().any(|m| m.role == "tool" && m
            .content
            .as_deref()
            .map(|c| c.contains("42"))
            .unwrap_or(false)));
        Ok(LlmReply::Text("There are 42 open tickets.".to_string()))
    }
}

struct MockMcp {
    executed: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl McpProvider for MockMcp {
    async fn list_tools(&self, _server_name: &str) -> Result<Vec<McpTool>> {
        Ok(vec![McpTool {
            name: "list_tickets".to_string(),
            description: "List tickets by status".to_string(),
        }])
    }

    async fn execute_action(
        &self,
        server_name: &str,
        action: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.executed
            .lock()
            .unwrap()
            .push((server_name.to_string(), action.to_string()));
        Ok(serde_json::json!({"open_tickets": 42}))
    }
}

fn mcp_source() -> SourceConfig {
    SourceConfig {
        id: "mcp-1".to_string(),
        name: "helpdesk".to_string(),
        source_type: SourceType::Mcp,
        sheets_qualified_table: None,
        user_notes: None,
        inferred_notes: None,
        memory_rules: vec![],
        mcp_provider: Some("helpdesk-provider".to_string()),
        mcp_server_name: Some("helpdesk".to_string()),
    }
}

#[tokio::test]
async fn test_mcp_tool_loop_round_trip() {
    let provider = Arc::new(McpScriptedProvider { tool_rounds: AtomicUsize::new(0) });
    let planner = PlannerService::new(provider, test_config());
    let run_store = Arc::new(InMemoryRunStore::new());
    let mut orchestrator = ChatOrchestrator::new(planner, run_store.clone());

    let mcp = Arc::new(MockMcp { executed: Mutex::new(Vec::new()) });
    orchestrator.register_mcp_provider("helpdesk-provider", mcp.clone());

    let outcome = orchestrator
        .run_chat_turn(ChatTurnRequest {
            question: "how many open tickets do we have".to_string(),
            source: mcp_source(),
            schema_cache: None,
            adapter: None,
            workflow_id: None,
            workflow_run_id: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.answer, "There are 42 open tickets.");
    assert!(outcome.trust.sql.is_none());
    assert!(!outcome.artifact_actions.can_save_sql);
    assert!(outcome.query_spec_draft.is_none());

    let executed = mcp.executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0], ("helpdesk".to_string(), "list_tickets".to_string()));

    let records = run_store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.run_type, RunType::Mcp);
}

#[tokio::test]
async fn test_mcp_unknown_provider_is_fatal() {
    let provider = Arc::new(McpScriptedProvider { tool_rounds: AtomicUsize::new(0) });
    let planner = PlannerService::new(provider, test_config());
    let orchestrator = ChatOrchestrator::new(planner, Arc::new(InMemoryRunStore::new()));

    let err = orchestrator
        .run_chat_turn(ChatTurnRequest {
            question: "anything".to_string(),
            source: mcp_source(),
            schema_cache: None,
            adapter: None,
            workflow_id: None,
            workflow_run_id: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PlannerError::UnsupportedProvider(_)));
    assert!(err.is_fatal());
}
