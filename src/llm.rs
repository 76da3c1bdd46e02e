//! Completion capability
//!
//! The planner treats the language model as a black-box text-completion
//! capability behind the `CompletionProvider` trait. `OpenAiClient` is the
//! production implementation against an OpenAI-compatible chat completions
//! endpoint; tests substitute scripted providers.

use crate::config::PlannerConfig;
use crate::error::{PlannerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            name: None,
            tool_call_id: None,
        }
    }

    /// Synthetic tool-result message fed back into the MCP loop.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            name: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model: String,
    pub max_tokens: u32,
}

/// Tool surface offered to the model in the MCP path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool parameters.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Reply from a tool-enabled completion call.
#[derive(Debug, Clone)]
pub enum LlmReply {
    Text(String),
    ToolCalls { calls: Vec<ToolCall>, text: Option<String> },
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Plain text completion over role-tagged messages.
    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<String>;

    /// Completion with a tool surface; returns either text or tool calls.
    async fn generate_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<LlmReply>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &PlannerConfig) -> Self {
        Self::new(config.api_key.clone(), config.base_url.clone())
    }

    fn build_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let mut msg = serde_json::json!({ "role": m.role });
                if let Some(ref content) = m.content {
                    msg["content"] = serde_json::json!(content);
                }
                if let Some(ref name) = m.name {
                    msg["name"] = serde_json::json!(name);
                }
                if let Some(ref tool_call_id) = m.tool_call_id {
                    msg["tool_call_id"] = serde_json::json!(tool_call_id);
                }
                msg
            })
            .collect()
    }

    async fn post_chat(&self, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PlannerError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PlannerError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PlannerError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(PlannerError::Llm(format!(
                "LLM API error: {}",
                serde_json::to_string(error).unwrap_or_else(|_| "Unknown error".to_string())
            )));
        }

        Ok(response_json)
    }

    fn first_choice(response_json: &serde_json::Value) -> Result<&serde_json::Value> {
        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| PlannerError::Llm("No choices array in LLM response".to_string()))?;
        choices
            .first()
            .ok_or_else(|| PlannerError::Llm("Empty choices array in LLM response".to_string()))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<String> {
        let body = serde_json::json!({
            "model": opts.model,
            "messages": Self::build_messages(messages),
            "temperature": 0.1,
            "max_tokens": opts.max_tokens,
        });

        let response_json = self.post_chat(body).await?;
        let choice = Self::first_choice(&response_json)?;

        if let Some(finish_reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            if finish_reason == "length" {
                tracing::warn!("LLM response was truncated due to length limit");
            } else if finish_reason == "content_filter" {
                return Err(PlannerError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ));
            }
        }

        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| PlannerError::Llm("No content in LLM response".to_string()))?;

        if content.is_empty() {
            return Err(PlannerError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }

    async fn generate_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<LlmReply> {
        let api_tools: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": opts.model,
            "messages": Self::build_messages(messages),
            "tools": api_tools,
            "tool_choice": "auto",
            "temperature": 0.1,
            "max_tokens": opts.max_tokens,
        });

        let response_json = self.post_chat(body).await?;
        let choice = Self::first_choice(&response_json)?;
        let message = &choice["message"];

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());

        if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
            let mut calls = Vec::new();
            for call in tool_calls {
                let id = call["id"]
                    .as_str()
                    .ok_or_else(|| PlannerError::Llm("Tool call missing id".to_string()))?
                    .to_string();
                let name = call["function"]["name"]
                    .as_str()
                    .ok_or_else(|| PlannerError::Llm("Tool call missing function name".to_string()))?
                    .to_string();
                let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
                let input: serde_json::Value = serde_json::from_str(arguments)
                    .unwrap_or_else(|_| serde_json::json!({}));
                calls.push(ToolCall { id, name, input });
            }
            if !calls.is_empty() {
                return Ok(LlmReply::ToolCalls { calls, text });
            }
        }

        match text {
            Some(t) if !t.is_empty() => Ok(LlmReply::Text(t)),
            _ => Err(PlannerError::Llm(
                "LLM returned neither text nor tool calls".to_string(),
            )),
        }
    }
}

/// Strip markdown code fences from a model response.
pub fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```sql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Leniently extract a JSON object from a model response.
///
/// Trims fences, tries a direct parse, then falls back to the first balanced
/// top-level `{...}` span. Models wrap JSON in prose often enough that the
/// direct parse alone is not reliable.
pub fn extract_json_object(response: &str) -> Result<serde_json::Value> {
    let cleaned = strip_code_fences(response);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(cleaned) {
        if value.is_object() {
            return Ok(value);
        }
    }

    let start = cleaned
        .find('{')
        .ok_or_else(|| PlannerError::Llm(format!("No JSON object in response: {}", cleaned)))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in cleaned[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let span = &cleaned[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(span).map_err(|e| {
                        PlannerError::Llm(format!("Failed to parse JSON span: {}. Span: {}", e, span))
                    });
                }
            }
            _ => {}
        }
    }

    Err(PlannerError::Llm(format!(
        "Unbalanced JSON object in response: {}",
        cleaned
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_direct() {
        let value = extract_json_object(r#"{"table": "orders"}"#).unwrap();
        assert_eq!(value["table"], "orders");
    }

    #[test]
    fn test_extract_json_fenced() {
        let value = extract_json_object("```json\n{\"table\": \"orders\"}\n```").unwrap();
        assert_eq!(value["table"], "orders");
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let value =
            extract_json_object("Here is the plan: {\"a\": {\"b\": 1}} hope that helps").unwrap();
        assert_eq!(value["a"]["b"], 1);
    }

    #[test]
    fn test_extract_json_braces_inside_strings() {
        let value = extract_json_object(r#"{"reason": "use {col} syntax"}"#).unwrap();
        assert_eq!(value["reason"], "use {col} syntax");
    }

    #[test]
    fn test_extract_json_missing_object() {
        assert!(extract_json_object("no json here").is_err());
    }
}
