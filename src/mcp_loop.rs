//! MCP tool loop
//!
//! Handler for tool-server sources: a bounded sequential loop against the
//! completion capability offering one dynamically-scoped tool, executing
//! each requested action through the MCP capability and feeding results back
//! as synthetic tool messages. Terminates on the first plain-text response.
//! This path never touches the SQL planner.

use crate::error::{PlannerError, Result};
use crate::llm::{ChatMessage, GenerateOptions, LlmReply, ToolDefinition};
use crate::planner::PlannerService;
use crate::source::{McpProvider, SourceConfig};
use tracing::{info, warn};

pub struct McpLoopResult {
    pub answer: String,
    pub reasoning: Vec<String>,
    pub rounds: u8,
}

const TOOL_NAME: &str = "execute_action";

pub async fn run_tool_loop(
    planner: &PlannerService,
    mcp: &dyn McpProvider,
    source: &SourceConfig,
    question: &str,
) -> Result<McpLoopResult> {
    let config = planner.config();
    let server_name = source.mcp_server_name.as_deref().unwrap_or(&source.name);

    let tools = mcp.list_tools(server_name).await?;
    if tools.is_empty() {
        return Err(PlannerError::Execution(format!(
            "MCP server '{}' exposes no actions",
            server_name
        )));
    }

    let action_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
    let action_list: Vec<String> = tools
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect();

    let tool_definition = ToolDefinition {
        name: TOOL_NAME.to_string(),
        description: format!(
            "Execute one named action on the connected tool server. Available actions:\n{}",
            action_list.join("\n")
        ),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": action_names },
                "params": { "type": "object" }
            },
            "required": ["action"]
        }),
    };

    let mut messages = vec![
        ChatMessage::system(
            "You answer questions by calling tool-server actions. Call actions as needed, then reply in plain text once you can answer.",
        ),
        ChatMessage::user(question),
    ];
    if let Some(guidance) = source.guidance() {
        messages.insert(1, ChatMessage::system(guidance));
    }

    let opts = GenerateOptions {
        model: config.model.clone(),
        max_tokens: config.answer_max_tokens,
    };

    let mut reasoning = Vec::new();

    for round in 1..=config.mcp_max_rounds {
        let reply = planner
            .provider()
            .generate_with_tools(&messages, &[tool_definition.clone()], &opts)
            .await?;

        match reply {
            LlmReply::Text(answer) => {
                info!(rounds = round, "MCP loop finished with a text answer");
                return Ok(McpLoopResult {
                    answer,
                    reasoning,
                    rounds: round,
                });
            }
            LlmReply::ToolCalls { calls, text } => {
                if let Some(text) = text {
                    if !text.trim().is_empty() {
                        messages.push(ChatMessage::assistant(text));
                    }
                }
                // Sequential round-trips; no concurrent tool calls in a turn.
                for call in calls {
                    let action = call
                        .input
                        .get("action")
                        .and_then(|a| a.as_str())
                        .unwrap_or("")
                        .to_string();
                    let params = call
                        .input
                        .get("params")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));

                    reasoning.push(format!("Round {}: action '{}'", round, action));

                    let content = if action.is_empty() {
                        warn!("Model requested a tool call without an action name");
                        serde_json::json!({"error": "missing action name"}).to_string()
                    } else {
                        match mcp.execute_action(server_name, &action, params).await {
                            Ok(result) => result.to_string(),
                            Err(e) => {
                                // Feed the failure back so the model can
                                // correct course within the round budget.
                                warn!("MCP action '{}' failed: {}", action, e);
                                serde_json::json!({ "error": e.to_string() }).to_string()
                            }
                        }
                    };
                    messages.push(ChatMessage::tool(call.id.clone(), content));
                }
            }
        }
    }

    Err(PlannerError::Execution(format!(
        "MCP tool loop exceeded {} rounds without a text answer",
        config.mcp_max_rounds
    )))
}
