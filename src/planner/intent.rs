//! Intent and candidate columns
//!
//! Phase-1 output: the user's objective, query type, and a small ranked set
//! of candidate columns with intended usage. Candidate columns are filtered
//! against the table's field set; the phase always yields a non-empty set.

use crate::error::Result;
use crate::llm::extract_json_object;
use crate::schema::PlannerSchemaContext;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Candidate columns shown to Phase 2 when the model returns nothing usable.
const FALLBACK_COLUMN_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Retrieval,
    Aggregation,
    Comparison,
    Window,
    Anomaly,
    Mixed,
}

impl QueryType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "retrieval" => QueryType::Retrieval,
            "aggregation" => QueryType::Aggregation,
            "comparison" => QueryType::Comparison,
            "window" => QueryType::Window,
            "anomaly" => QueryType::Anomaly,
            _ => QueryType::Mixed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Retrieval => "retrieval",
            QueryType::Aggregation => "aggregation",
            QueryType::Comparison => "comparison",
            QueryType::Window => "window",
            QueryType::Anomaly => "anomaly",
            QueryType::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnUsage {
    Select,
    Filter,
    Group,
    Order,
    Aggregate,
}

impl ColumnUsage {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "filter" => ColumnUsage::Filter,
            "group" => ColumnUsage::Group,
            "order" => ColumnUsage::Order,
            "aggregate" => ColumnUsage::Aggregate,
            _ => ColumnUsage::Select,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnUsage::Select => "select",
            ColumnUsage::Filter => "filter",
            ColumnUsage::Group => "group",
            ColumnUsage::Order => "order",
            ColumnUsage::Aggregate => "aggregate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerIntent {
    pub objective: String,
    pub entities: Vec<String>,
    pub metrics: Vec<String>,
    pub dimensions: Vec<String>,
    pub query_type: QueryType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerColumnChoice {
    pub column: String,
    pub usage: ColumnUsage,
    pub reason: String,
    pub confidence: f64,
}

/// Phase-1 result handed to Phase 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase1Result {
    pub intent: PlannerIntent,
    pub columns: Vec<PlannerColumnChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPhase1 {
    #[serde(default)]
    objective: String,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    metrics: Vec<String>,
    #[serde(default)]
    dimensions: Vec<String>,
    #[serde(default, alias = "queryType")]
    query_type: String,
    #[serde(default)]
    columns: Vec<RawColumnChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct RawColumnChoice {
    #[serde(default)]
    column: String,
    #[serde(default)]
    usage: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    confidence: Option<f64>,
}

impl Phase1Result {
    /// Decode a Phase-1 model response, defending against hallucinated
    /// columns and guaranteeing Phase 2 a non-empty candidate set.
    pub fn from_response(response: &str, ctx: &PlannerSchemaContext) -> Result<Self> {
        let value = extract_json_object(response)?;
        let raw: RawPhase1 = serde_json::from_value(value)?;

        let mut columns: Vec<PlannerColumnChoice> = raw
            .columns
            .into_iter()
            .filter_map(|c| {
                if !ctx.has_field(&c.column) {
                    warn!("Dropping hallucinated candidate column '{}'", c.column);
                    return None;
                }
                Some(PlannerColumnChoice {
                    column: c.column,
                    usage: ColumnUsage::parse(&c.usage),
                    reason: c.reason,
                    confidence: c.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                })
            })
            .collect();

        if columns.is_empty() {
            columns = fallback_columns(ctx);
        }

        Ok(Phase1Result {
            intent: PlannerIntent {
                objective: raw.objective,
                entities: raw.entities,
                metrics: raw.metrics,
                dimensions: raw.dimensions,
                query_type: QueryType::parse(&raw.query_type),
            },
            columns,
        })
    }
}

fn fallback_columns(ctx: &PlannerSchemaContext) -> Vec<PlannerColumnChoice> {
    ctx.fields
        .iter()
        .take(FALLBACK_COLUMN_COUNT.min(ctx.fields.len()))
        .map(|f| PlannerColumnChoice {
            column: f.column.clone(),
            usage: ColumnUsage::Select,
            reason: "Fallback from schema".to_string(),
            confidence: 0.2,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, PlannerField};
    use crate::source::SourceType;

    fn ctx(columns: &[&str]) -> PlannerSchemaContext {
        PlannerSchemaContext {
            source_type: SourceType::Postgres,
            source_name: "warehouse".to_string(),
            table_name: "orders".to_string(),
            fields: columns
                .iter()
                .map(|c| PlannerField {
                    column: c.to_string(),
                    field_type: FieldType::String,
                    nullable: true,
                    description: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_hallucinated_columns_filtered() {
        let response = r#"{
            "objective": "totals",
            "query_type": "aggregation",
            "columns": [
                {"column": "customer", "usage": "group", "reason": "grouping key", "confidence": 0.9},
                {"column": "made_up", "usage": "select", "reason": "", "confidence": 0.9}
            ]
        }"#;
        let result = Phase1Result::from_response(response, &ctx(&["customer", "amount"])).unwrap();
        assert_eq!(result.columns.len(), 1);
        assert_eq!(result.columns[0].usage, ColumnUsage::Group);
        assert_eq!(result.intent.query_type, QueryType::Aggregation);
    }

    #[test]
    fn test_fallback_when_no_valid_columns() {
        let response = r#"{"objective": "x", "columns": [{"column": "ghost", "usage": "select"}]}"#;
        let many: Vec<String> = (0..10).map(|i| format!("c{}", i)).collect();
        let refs: Vec<&str> = many.iter().map(|s| s.as_str()).collect();
        let result = Phase1Result::from_response(response, &ctx(&refs)).unwrap();
        assert_eq!(result.columns.len(), 6);
        assert!(result.columns.iter().all(|c| c.reason == "Fallback from schema"));
        assert!(result.columns.iter().all(|c| (c.confidence - 0.2).abs() < f64::EPSILON));
    }

    #[test]
    fn test_usage_and_query_type_coercion() {
        let response = r#"{
            "query_type": "interpretive dance",
            "columns": [{"column": "a", "usage": "projection"}]
        }"#;
        let result = Phase1Result::from_response(response, &ctx(&["a"])).unwrap();
        assert_eq!(result.intent.query_type, QueryType::Mixed);
        assert_eq!(result.columns[0].usage, ColumnUsage::Select);
    }
}
