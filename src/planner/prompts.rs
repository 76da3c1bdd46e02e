//! Prompt templates
//!
//! Every completion call in the planning pipeline is templated here. Prompts
//! ask for strict JSON; decoding stays lenient on the way back in.

use crate::planner::intent::Phase1Result;
use crate::schema::PlannerSchemaContext;

/// Render the selected table's fields for phase prompts.
pub fn table_context_text(ctx: &PlannerSchemaContext) -> String {
    let mut lines = vec![format!("Table: {}", ctx.table_name)];
    for field in &ctx.fields {
        let nullable = if field.nullable { ", nullable" } else { "" };
        lines.push(format!("  - {}: {}{}", field.column, field.field_type.as_str(), nullable));
    }
    lines.join("\n")
}

fn guidance_block(guidance: Option<&str>) -> String {
    match guidance {
        Some(g) if !g.trim().is_empty() => format!("\nContext from the source owner:\n{}\n", g.trim()),
        _ => String::new(),
    }
}

pub fn table_selection_prompt(
    question: &str,
    tables: &[String],
    schema_text: &str,
    guidance: Option<&str>,
) -> String {
    format!(
        r#"Pick the single best table to answer the question. Return JSON only.

Question: "{}"

Allowed table names:
{}

Schema:
{}
{}
Format: {{"table":"exact name from the allowed list","reasoning":"one sentence","confidence":0.0-1.0}}"#,
        question,
        tables.join("\n"),
        schema_text,
        guidance_block(guidance),
    )
}

pub fn phase1_prompt(question: &str, ctx: &PlannerSchemaContext, guidance: Option<&str>) -> String {
    format!(
        r#"Analyze the question against the table schema. Return JSON only.

Question: "{}"

{}
{}
Determine the user's objective and which columns matter. Usage must be one of
"select", "filter", "group", "order", "aggregate". query_type must be one of
"retrieval", "aggregation", "comparison", "window", "anomaly", "mixed".

Format:
{{
  "objective": "what the user wants",
  "entities": ["business entities mentioned"],
  "metrics": ["quantities to measure"],
  "dimensions": ["attributes to slice by"],
  "query_type": "aggregation",
  "columns": [
    {{"column": "exact column name", "usage": "aggregate", "reason": "why", "confidence": 0.9}}
  ]
}}"#,
        question,
        table_context_text(ctx),
        guidance_block(guidance),
    )
}

pub fn phase2_prompt(
    question: &str,
    ctx: &PlannerSchemaContext,
    phase1: &Phase1Result,
    guidance: Option<&str>,
    execution_error: Option<&str>,
) -> String {
    let candidates: Vec<String> = phase1
        .columns
        .iter()
        .map(|c| format!("- {} (usage: {}, confidence: {:.2})", c.column, c.usage.as_str(), c.confidence))
        .collect();

    let error_block = match execution_error {
        Some(err) => format!(
            "\nThe previous attempt failed. Produce a corrected plan that avoids this failure:\n{}\n",
            err
        ),
        None => String::new(),
    };

    format!(
        r#"Build a structured query plan for the question. Return JSON only — never SQL.

Question: "{}"

{}

Objective: {}
Query type: {}
Candidate columns:
{}
{}{}
Rules:
- Use only column names from the table schema above.
- aggregations[].function must be one of SUM, AVG, COUNT, COUNT_DISTINCT, MIN, MAX; column "*" is allowed only for COUNT.
- filters[].operator must be one of =, !=, >, <, >=, <=, LIKE, IN, NOT IN, IS NULL, IS NOT NULL, BETWEEN.
- When aggregating, every plain select column must also be listed in group_by.
- At most one window; window.function must be one of RUNNING_SUM, RUNNING_COUNT, RUNNING_AVG and needs order_by.
- Include limit only when the user explicitly asked for a bounded result.

Format:
{{
  "select": ["col"],
  "filters": [{{"column": "col", "operator": ">=", "value": 100}}],
  "aggregations": [{{"function": "SUM", "column": "col", "alias": "total_col"}}],
  "group_by": ["col"],
  "order_by": [{{"column": "total_col", "direction": "DESC"}}],
  "window": null,
  "limit": null,
  "rationale": "one sentence on the approach"
}}"#,
        question,
        table_context_text(ctx),
        phase1.intent.objective,
        phase1.intent.query_type.as_str(),
        candidates.join("\n"),
        guidance_block(guidance),
        error_block,
    )
}

pub fn phase3_prompt(
    question: &str,
    ctx: &PlannerSchemaContext,
    sql: &str,
    guidance: Option<&str>,
) -> String {
    format!(
        r#"Review the generated SQL against the question and schema. Return JSON only.

Question: "{}"

{}
{}
SQL under review:
{}

Check that the SQL answers the question, references only schema columns, and
aggregates/groups coherently. List concrete issues if any.

Format: {{"approved":true,"confidence":0.0-1.0,"issues":["..."],"corrected_sql":null,"explanation":"one sentence"}}"#,
        question,
        table_context_text(ctx),
        guidance_block(guidance),
        sql,
    )
}

pub fn answer_synthesis_prompt(question: &str, sql: &str, sample_rows_json: &str, row_count: usize) -> String {
    format!(
        r#"Answer the user's question strictly from the query results below. Do not
invent values that are not in the rows. If the rows cannot answer the
question, say so plainly.

Question: "{}"

SQL executed:
{}

Total rows: {}
Sample rows (JSON):
{}

Write a concise natural-language answer grounded in these rows."#,
        question, sql, row_count, sample_rows_json,
    )
}
