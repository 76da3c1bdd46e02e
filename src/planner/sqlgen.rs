//! Deterministic SQL generator
//!
//! Pure function from (schema context, plan, safety findings, dialect) to
//! SQL text. All identifiers and literal values funnel through
//! `quote_identifier`/`escape_string`; the model never contributes SQL text.

use crate::planner::plan::{
    AggregateFunction, FilterOperator, PlannerAggregate, PlannerFilter, PlannerWindow, QueryPlan,
    WindowFunction, WILDCARD,
};
use crate::planner::safety::SafetyResult;
use crate::schema::PlannerSchemaContext;
use crate::source::SourceType;
use itertools::Itertools;

const DEFAULT_FRAME: &str = "ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// BigQuery family: backtick identifiers, FLOAT64 cast target.
    BigQuery,
    /// ANSI/Postgres family: double-quote identifiers, DOUBLE PRECISION.
    Ansi,
}

impl SqlDialect {
    pub fn for_source(source_type: SourceType) -> Self {
        match source_type {
            SourceType::BigQuery | SourceType::SheetsBigQuery => SqlDialect::BigQuery,
            SourceType::Postgres | SourceType::Mcp => SqlDialect::Ansi,
        }
    }

    pub fn is_bigquery_family(&self) -> bool {
        matches!(self, SqlDialect::BigQuery)
    }

    fn cast_target(&self) -> &'static str {
        match self {
            SqlDialect::BigQuery => "FLOAT64",
            SqlDialect::Ansi => "DOUBLE PRECISION",
        }
    }
}

pub fn quote_identifier(dialect: SqlDialect, identifier: &str) -> String {
    match dialect {
        SqlDialect::BigQuery => format!("`{}`", identifier.replace('`', "")),
        SqlDialect::Ansi => format!("\"{}\"", identifier.replace('"', "\"\"")),
    }
}

/// Table references may be dotted (`project.dataset.table`); BigQuery quotes
/// the whole reference, ANSI quotes each path segment.
fn quote_table(dialect: SqlDialect, table: &str) -> String {
    match dialect {
        SqlDialect::BigQuery => format!("`{}`", table.replace('`', "")),
        SqlDialect::Ansi => table
            .split('.')
            .map(|part| quote_identifier(dialect, part))
            .join("."),
    }
}

pub fn escape_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Generate the SQL text for a validated plan.
///
/// Idempotent: identical `(ctx, plan, safety)` inputs yield byte-identical
/// SQL. Output is pretty-printed multi-line text, a stable contract for logs
/// and audits.
pub fn generate_sql(ctx: &PlannerSchemaContext, plan: &QueryPlan, safety: &SafetyResult) -> String {
    let dialect = SqlDialect::for_source(ctx.source_type);
    let mut select_parts: Vec<String> = Vec::new();

    for column in &plan.select {
        select_parts.push(quote_identifier(dialect, column));
    }

    for aggregate in &plan.aggregations {
        select_parts.push(render_aggregate(dialect, aggregate, safety));
    }

    if let Some(ref window) = plan.window {
        select_parts.push(render_window(dialect, window, safety));
    }

    if select_parts.is_empty() {
        select_parts.push(WILDCARD.to_string());
    }

    let mut lines = Vec::new();
    lines.push("SELECT".to_string());
    lines.push(format!("  {}", select_parts.join(",\n  ")));
    lines.push(format!("FROM {}", quote_table(dialect, &ctx.table_name)));

    let conjuncts: Vec<String> = plan
        .filters
        .iter()
        .filter_map(|f| render_filter(dialect, f))
        .collect();
    if !conjuncts.is_empty() {
        lines.push(format!("WHERE {}", conjuncts.join("\n  AND ")));
    }

    if !plan.aggregations.is_empty() && !plan.group_by.is_empty() {
        let grouped: Vec<String> = plan
            .group_by
            .iter()
            .unique()
            .map(|c| quote_identifier(dialect, c))
            .collect();
        lines.push(format!("GROUP BY {}", grouped.join(", ")));
    }

    if !plan.order_by.is_empty() {
        let ordered: Vec<String> = plan
            .order_by
            .iter()
            .map(|o| format!("{} {}", quote_identifier(dialect, &o.column), o.direction.as_sql()))
            .collect();
        lines.push(format!("ORDER BY {}", ordered.join(", ")));
    }

    if let Some(limit) = plan.limit {
        lines.push(format!("LIMIT {}", limit));
    }

    lines.join("\n")
}

// Cast innermost, coalesce outermost, per the safety classification lists.
fn guarded_column(dialect: SqlDialect, column: &str, safety: &SafetyResult) -> String {
    let mut expr = quote_identifier(dialect, column);
    if safety.numeric_cast_columns.iter().any(|c| c == column) {
        expr = format!("CAST({} AS {})", expr, dialect.cast_target());
    }
    if safety.null_safe_columns.iter().any(|c| c == column) {
        expr = format!("COALESCE({}, 0)", expr);
    }
    expr
}

fn render_aggregate(
    dialect: SqlDialect,
    aggregate: &PlannerAggregate,
    safety: &SafetyResult,
) -> String {
    let alias = quote_identifier(dialect, &aggregate.alias);
    match aggregate.function {
        AggregateFunction::Count if aggregate.column == WILDCARD => {
            format!("COUNT(*) AS {}", alias)
        }
        AggregateFunction::CountDistinct => format!(
            "COUNT(DISTINCT {}) AS {}",
            quote_identifier(dialect, &aggregate.column),
            alias
        ),
        function => format!(
            "{}({}) AS {}",
            function.as_sql(),
            guarded_column(dialect, &aggregate.column, safety),
            alias
        ),
    }
}

fn render_window(dialect: SqlDialect, window: &PlannerWindow, safety: &SafetyResult) -> String {
    let argument = match window.function {
        WindowFunction::RunningCount => WILDCARD.to_string(),
        _ => guarded_column(dialect, &window.column, safety),
    };

    let mut over_parts = Vec::new();
    if !window.partition_by.is_empty() {
        let partitions: Vec<String> = window
            .partition_by
            .iter()
            .map(|c| quote_identifier(dialect, c))
            .collect();
        over_parts.push(format!("PARTITION BY {}", partitions.join(", ")));
    }
    if let Some(ref order) = window.order_by {
        over_parts.push(format!(
            "ORDER BY {} {}",
            quote_identifier(dialect, &order.column),
            order.direction.as_sql()
        ));
    }
    over_parts.push(window.frame.clone().unwrap_or_else(|| DEFAULT_FRAME.to_string()));

    format!(
        "{}({}) OVER ({}) AS {}",
        window.function.as_sql(),
        argument,
        over_parts.join(" "),
        quote_identifier(dialect, &window.alias)
    )
}

// One conjunct per filter; filters with unusable values contribute nothing.
fn render_filter(dialect: SqlDialect, filter: &PlannerFilter) -> Option<String> {
    let column = quote_identifier(dialect, &filter.column);

    match filter.operator {
        FilterOperator::IsNull | FilterOperator::IsNotNull => {
            Some(format!("{} {}", column, filter.operator.as_sql()))
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let values = filter.value.as_ref()?.as_array()?;
            if values.is_empty() {
                // Never emit `IN ()`.
                return None;
            }
            let rendered: Vec<String> = values
                .iter()
                .filter_map(|v| render_scalar(v, filter.value_type.as_deref()))
                .collect();
            if rendered.is_empty() {
                return None;
            }
            Some(format!(
                "{} {} ({})",
                column,
                filter.operator.as_sql(),
                rendered.join(", ")
            ))
        }
        FilterOperator::Between => {
            let values = filter.value.as_ref()?.as_array()?;
            if values.len() != 2 {
                return None;
            }
            let low = render_scalar(&values[0], filter.value_type.as_deref())?;
            let high = render_scalar(&values[1], filter.value_type.as_deref())?;
            Some(format!("{} BETWEEN {} AND {}", column, low, high))
        }
        _ => {
            let value = filter.value.as_ref()?;
            let rendered = render_scalar(value, filter.value_type.as_deref())?;
            Some(format!("{} {} {}", column, filter.operator.as_sql(), rendered))
        }
    }
}

fn render_scalar(value: &serde_json::Value, value_type: Option<&str>) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(if *b { "TRUE".to_string() } else { "FALSE".to_string() }),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => {
            // A declared numeric value type lets a stringly-typed literal
            // through unquoted when it parses cleanly.
            if value_type == Some("number") {
                if let Ok(parsed) = s.trim().parse::<f64>() {
                    if parsed.is_finite() {
                        return Some(s.trim().to_string());
                    }
                }
            }
            Some(format!("'{}'", escape_string(s)))
        }
        _ => None,
    }
}
