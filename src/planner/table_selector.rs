//! Table selector
//!
//! Picks exactly one table for the planning call. Degenerates to a no-op
//! when the source exposes a single table.

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::llm::{extract_json_object, ChatMessage, CompletionProvider, GenerateOptions};
use crate::planner::prompts;
use crate::schema::SchemaBundle;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSelection {
    pub table_name: String,
    pub reasoning: String,
    pub confidence: Option<f64>,
}

pub async fn select_best_table(
    provider: &dyn CompletionProvider,
    config: &PlannerConfig,
    question: &str,
    bundle: &SchemaBundle,
    guidance: Option<&str>,
) -> Result<TableSelection> {
    if bundle.tables.len() == 1 {
        return Ok(TableSelection {
            table_name: bundle.tables[0].clone(),
            reasoning: "Single table available for source.".to_string(),
            confidence: Some(1.0),
        });
    }

    let prompt = prompts::table_selection_prompt(question, &bundle.tables, &bundle.schema_text, guidance);
    let messages = vec![
        ChatMessage::system("Return JSON only, no text."),
        ChatMessage::user(prompt),
    ];
    let opts = GenerateOptions {
        model: config.model.clone(),
        max_tokens: config.plan_max_tokens,
    };
    let response = provider.generate(&messages, &opts).await?;
    let value = extract_json_object(&response)?;

    let returned = value
        .get("table")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let reasoning = value
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();
    let confidence = value.get("confidence").and_then(|c| c.as_f64());

    let table_name = resolve_table_name(&returned, &bundle.tables);
    info!("Table selector chose '{}' for question", table_name);

    Ok(TableSelection {
        table_name,
        reasoning,
        confidence,
    })
}

/// Resolve a model-returned table name against the allowed list.
///
/// Exact match first, then a suffix match for qualified identifiers the
/// model returned unqualified, then the first table as a last resort.
fn resolve_table_name(returned: &str, tables: &[String]) -> String {
    if tables.iter().any(|t| t == returned) {
        return returned.to_string();
    }

    if !returned.is_empty() {
        if let Some(suffixed) = tables.iter().find(|t| t.ends_with(&format!(".{}", returned))) {
            warn!(
                "Table selector returned partial name '{}'; matched '{}' by suffix",
                returned, suffixed
            );
            return suffixed.clone();
        }
    }

    warn!(
        "Table selector returned unknown table '{}'; falling back to '{}'",
        returned, tables[0]
    );
    tables[0].clone()
}
