//! Structured query plan
//!
//! The model-proposed intermediate representation of a query, decoded from
//! strict JSON and validated field-by-field against the selected table's
//! schema before any SQL text exists. Unknown columns are dropped at
//! construction time, never passed through to SQL generation.

use crate::error::Result;
use crate::llm::extract_json_object;
use crate::schema::PlannerSchemaContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MAX_SELECT_COLUMNS: usize = 16;
pub const MAX_AGGREGATIONS: usize = 8;
pub const MAX_FILTERS: usize = 12;
pub const MAX_GROUP_BY: usize = 12;
pub const MAX_ORDER_BY: usize = 8;
pub const MAX_PARTITION_BY: usize = 8;

pub const WILDCARD: &str = "*";

lazy_static! {
    // Window frames are free text from the model; only conventional frame
    // clauses are allowed through.
    static ref FRAME_RE: Regex =
        Regex::new(r"(?i)^(ROWS|RANGE)\s+BETWEEN\s+[A-Za-z0-9_\s]+$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    Like,
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
    #[serde(rename = "IS NULL")]
    IsNull,
    #[serde(rename = "IS NOT NULL")]
    IsNotNull,
    Between,
}

impl FilterOperator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "=" | "==" => Some(FilterOperator::Eq),
            "!=" | "<>" => Some(FilterOperator::Ne),
            ">" => Some(FilterOperator::Gt),
            "<" => Some(FilterOperator::Lt),
            ">=" => Some(FilterOperator::Ge),
            "<=" => Some(FilterOperator::Le),
            "LIKE" => Some(FilterOperator::Like),
            "IN" => Some(FilterOperator::In),
            "NOT IN" => Some(FilterOperator::NotIn),
            "IS NULL" => Some(FilterOperator::IsNull),
            "IS NOT NULL" => Some(FilterOperator::IsNotNull),
            "BETWEEN" => Some(FilterOperator::Between),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Ne => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Lt => "<",
            FilterOperator::Ge => ">=",
            FilterOperator::Le => "<=",
            FilterOperator::Like => "LIKE",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT IN",
            FilterOperator::IsNull => "IS NULL",
            FilterOperator::IsNotNull => "IS NOT NULL",
            FilterOperator::Between => "BETWEEN",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            FilterOperator::Gt | FilterOperator::Lt | FilterOperator::Ge | FilterOperator::Le
        )
    }

    pub fn needs_value(&self) -> bool {
        !matches!(self, FilterOperator::IsNull | FilterOperator::IsNotNull)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    CountDistinct,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "SUM" => Some(AggregateFunction::Sum),
            "AVG" | "AVERAGE" | "MEAN" => Some(AggregateFunction::Avg),
            "COUNT" => Some(AggregateFunction::Count),
            "COUNT_DISTINCT" | "COUNT DISTINCT" => Some(AggregateFunction::CountDistinct),
            "MIN" => Some(AggregateFunction::Min),
            "MAX" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Count => "COUNT",
            AggregateFunction::CountDistinct => "COUNT",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }

    /// Functions whose argument must be numeric after casting.
    pub fn is_numeric(&self) -> bool {
        matches!(self, AggregateFunction::Sum | AggregateFunction::Avg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowFunction {
    RunningSum,
    RunningCount,
    RunningAvg,
}

impl WindowFunction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "RUNNING_SUM" => Some(WindowFunction::RunningSum),
            "RUNNING_COUNT" => Some(WindowFunction::RunningCount),
            "RUNNING_AVG" => Some(WindowFunction::RunningAvg),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            WindowFunction::RunningSum => "SUM",
            WindowFunction::RunningCount => "COUNT",
            WindowFunction::RunningAvg => "AVG",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, WindowFunction::RunningSum | WindowFunction::RunningAvg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "DESC" | "DESCENDING" => OrderDirection::Desc,
            _ => OrderDirection::Asc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerOrder {
    pub column: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerFilter {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub value_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerAggregate {
    pub function: AggregateFunction,
    /// May be the literal wildcard only for COUNT.
    pub column: String,
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerWindow {
    pub function: WindowFunction,
    pub column: String,
    pub alias: String,
    pub partition_by: Vec<String>,
    #[serde(default)]
    pub order_by: Option<PlannerOrder>,
    #[serde(default)]
    pub frame: Option<String>,
}

/// Validated Phase-2 plan. At most one window per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub select: Vec<String>,
    pub filters: Vec<PlannerFilter>,
    pub aggregations: Vec<PlannerAggregate>,
    pub group_by: Vec<String>,
    pub order_by: Vec<PlannerOrder>,
    #[serde(default)]
    pub window: Option<PlannerWindow>,
    #[serde(default)]
    pub limit: Option<u64>,
    pub rationale: String,
}

// Untyped shapes the model is asked to emit. Lenient on decode; everything
// is re-validated against the schema context below.
#[derive(Debug, Default, Deserialize)]
struct RawPlan {
    #[serde(default)]
    select: Vec<String>,
    #[serde(default)]
    filters: Vec<RawFilter>,
    #[serde(default)]
    aggregations: Vec<RawAggregate>,
    #[serde(default, alias = "groupBy")]
    group_by: Vec<String>,
    #[serde(default, alias = "orderBy")]
    order_by: Vec<RawOrder>,
    #[serde(default)]
    window: Option<RawWindow>,
    #[serde(default)]
    limit: Option<serde_json::Value>,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawFilter {
    #[serde(default)]
    column: String,
    #[serde(default)]
    operator: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default, alias = "valueType")]
    value_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAggregate {
    #[serde(default)]
    function: String,
    #[serde(default)]
    column: String,
    #[serde(default)]
    alias: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOrder {
    #[serde(default)]
    column: String,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWindow {
    #[serde(default)]
    function: String,
    #[serde(default)]
    column: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default, alias = "partitionBy")]
    partition_by: Vec<String>,
    #[serde(default, alias = "orderBy")]
    order_by: Option<RawOrder>,
    #[serde(default)]
    frame: Option<String>,
}

impl QueryPlan {
    /// Decode a model response into a validated plan.
    pub fn from_response(response: &str, ctx: &PlannerSchemaContext) -> Result<Self> {
        let value = extract_json_object(response)?;
        let raw: RawPlan = serde_json::from_value(value)?;
        Ok(Self::from_raw(raw, ctx))
    }

    fn from_raw(raw: RawPlan, ctx: &PlannerSchemaContext) -> Self {
        let select: Vec<String> = raw
            .select
            .into_iter()
            .filter(|c| {
                let known = ctx.has_field(c);
                if !known {
                    warn!("Dropping unknown select column '{}'", c);
                }
                known
            })
            .take(MAX_SELECT_COLUMNS)
            .collect();

        let filters: Vec<PlannerFilter> = raw
            .filters
            .into_iter()
            .filter_map(|f| {
                if !ctx.has_field(&f.column) {
                    warn!("Dropping filter on unknown column '{}'", f.column);
                    return None;
                }
                let operator = match FilterOperator::parse(&f.operator) {
                    Some(op) => op,
                    None => {
                        warn!("Dropping filter with unknown operator '{}'", f.operator);
                        return None;
                    }
                };
                Some(PlannerFilter {
                    column: f.column,
                    operator,
                    value: f.value,
                    value_type: f.value_type,
                })
            })
            .take(MAX_FILTERS)
            .collect();

        let aggregations: Vec<PlannerAggregate> = raw
            .aggregations
            .into_iter()
            .filter_map(|a| {
                let function = match AggregateFunction::parse(&a.function) {
                    Some(f) => f,
                    None => {
                        warn!("Dropping aggregation with unknown function '{}'", a.function);
                        return None;
                    }
                };
                let column = a.column.trim().to_string();
                if column == WILDCARD {
                    // Wildcard argument is defined for COUNT only.
                    if function != AggregateFunction::Count {
                        warn!("Dropping wildcard aggregate for {:?}", function);
                        return None;
                    }
                } else if !ctx.has_field(&column) {
                    warn!("Dropping aggregation on unknown column '{}'", column);
                    return None;
                }
                let alias = a
                    .alias
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| default_alias(function, &column));
                Some(PlannerAggregate { function, column, alias })
            })
            .take(MAX_AGGREGATIONS)
            .collect();

        let group_by: Vec<String> = raw
            .group_by
            .into_iter()
            .filter(|c| {
                let known = ctx.has_field(c);
                if !known {
                    warn!("Dropping unknown group-by column '{}'", c);
                }
                known
            })
            .take(MAX_GROUP_BY)
            .collect();

        let order_by: Vec<PlannerOrder> = raw
            .order_by
            .into_iter()
            .filter_map(|o| validate_order(o, ctx, &aggregations))
            .take(MAX_ORDER_BY)
            .collect();

        let window = raw.window.and_then(|w| validate_window(w, ctx));

        let limit = raw.limit.and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_u64().filter(|&l| l > 0),
            serde_json::Value::String(s) => s.parse::<u64>().ok().filter(|&l| l > 0),
            _ => None,
        });

        QueryPlan {
            select,
            filters,
            aggregations,
            group_by,
            order_by,
            window,
            limit,
            rationale: raw.rationale,
        }
    }
}

fn default_alias(function: AggregateFunction, column: &str) -> String {
    let base = if column == WILDCARD { "all" } else { column };
    match function {
        AggregateFunction::Sum => format!("sum_{}", base),
        AggregateFunction::Avg => format!("avg_{}", base),
        AggregateFunction::Count => format!("count_{}", base),
        AggregateFunction::CountDistinct => format!("distinct_{}", base),
        AggregateFunction::Min => format!("min_{}", base),
        AggregateFunction::Max => format!("max_{}", base),
    }
}

// Order-by may reference a schema column or an aggregate alias.
fn validate_order(
    raw: RawOrder,
    ctx: &PlannerSchemaContext,
    aggregations: &[PlannerAggregate],
) -> Option<PlannerOrder> {
    let known =
        ctx.has_field(&raw.column) || aggregations.iter().any(|a| a.alias == raw.column);
    if !known {
        warn!("Dropping order-by on unknown column '{}'", raw.column);
        return None;
    }
    Some(PlannerOrder {
        column: raw.column,
        direction: OrderDirection::parse(raw.direction.as_deref().unwrap_or("ASC")),
    })
}

fn validate_window(raw: RawWindow, ctx: &PlannerSchemaContext) -> Option<PlannerWindow> {
    let function = match WindowFunction::parse(&raw.function) {
        Some(f) => f,
        None => {
            warn!("Dropping window with unknown function '{}'", raw.function);
            return None;
        }
    };

    let column = raw.column.trim().to_string();
    // Column resolution is re-checked by the safety validator; here we only
    // drop structurally hopeless windows (empty column for numeric windows).
    if column.is_empty() && function != WindowFunction::RunningCount {
        warn!("Dropping window with empty column for {:?}", function);
        return None;
    }

    let partition_by: Vec<String> = raw
        .partition_by
        .into_iter()
        .filter(|c| {
            let known = ctx.has_field(c);
            if !known {
                warn!("Dropping unknown partition-by column '{}'", c);
            }
            known
        })
        .take(MAX_PARTITION_BY)
        .collect();

    let order_by = raw.order_by.and_then(|o| {
        if ctx.has_field(&o.column) {
            Some(PlannerOrder {
                column: o.column,
                direction: OrderDirection::parse(o.direction.as_deref().unwrap_or("ASC")),
            })
        } else {
            warn!("Dropping window order-by on unknown column '{}'", o.column);
            None
        }
    });

    let frame = raw.frame.filter(|f| {
        let ok = FRAME_RE.is_match(f.trim());
        if !ok {
            warn!("Dropping unrecognized window frame '{}'", f);
        }
        ok
    });

    let alias = raw
        .alias
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| {
            let base = if column.is_empty() { "rows" } else { column.as_str() };
            format!("running_{}", base)
        });

    Some(PlannerWindow {
        function,
        column: if column.is_empty() { WILDCARD.to_string() } else { column },
        alias,
        partition_by,
        order_by,
        frame,
    })
}
