//! Safety validator
//!
//! Pure, deterministic pass over a plan catching structural defects before
//! SQL is generated. Blocking issues stop generation; warnings are advisory.
//! No completion calls.

use crate::planner::plan::{QueryPlan, WILDCARD};
use crate::schema::{FieldType, PlannerSchemaContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyResult {
    /// Structural defects; SQL must not be generated while any are present.
    pub issues: Vec<String>,
    /// Advisory findings; generation proceeds.
    pub warnings: Vec<String>,
    /// Nullable columns used in an aggregate, to be wrapped in COALESCE.
    pub null_safe_columns: Vec<String>,
    /// Non-numeric columns used in a numeric aggregate/window, to be CAST.
    pub numeric_cast_columns: Vec<String>,
}

impl SafetyResult {
    pub fn is_blocking(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// Validate a plan against its schema context.
pub fn validate_safety(ctx: &PlannerSchemaContext, plan: &QueryPlan) -> SafetyResult {
    let mut result = SafetyResult::default();

    // Every plain select column must be grouped once aggregations exist.
    if !plan.aggregations.is_empty() {
        for column in &plan.select {
            if !plan.group_by.contains(column) {
                result.issues.push(format!(
                    "Column '{}' is selected alongside aggregations but missing from GROUP BY",
                    column
                ));
            }
        }
    }

    if let Some(ref window) = plan.window {
        // Running calculations require a deterministic order.
        if window.order_by.is_none() {
            result.issues.push(format!(
                "Window '{}' has no ORDER BY column; running calculations require one",
                window.alias
            ));
        }

        if window.column != WILDCARD && !ctx.has_field(&window.column) {
            result.issues.push(format!(
                "Window column '{}' does not resolve to a known field",
                window.column
            ));
        }

        if !plan.aggregations.is_empty() {
            result.warnings.push(
                "Plan mixes a window function with aggregations; single-pattern intent is ambiguous"
                    .to_string(),
            );
        }

        if window.function.is_numeric() && window.column != WILDCARD {
            if let Some(field) = ctx.field(&window.column) {
                if !field.field_type.is_numeric() {
                    push_unique(&mut result.numeric_cast_columns, &window.column);
                }
            }
        }
    }

    for filter in &plan.filters {
        if filter.operator.is_comparison() {
            if let Some(field) = ctx.field(&filter.column) {
                if field.field_type == FieldType::String {
                    result.warnings.push(format!(
                        "Comparison '{}' against string-typed column '{}'",
                        filter.operator.as_sql(),
                        filter.column
                    ));
                }
            }
        }
    }

    for aggregate in &plan.aggregations {
        if aggregate.column == WILDCARD {
            continue;
        }
        if let Some(field) = ctx.field(&aggregate.column) {
            if aggregate.function.is_numeric() && !field.field_type.is_numeric() {
                push_unique(&mut result.numeric_cast_columns, &aggregate.column);
            }
            if field.nullable {
                push_unique(&mut result.null_safe_columns, &aggregate.column);
            }
        }
    }

    result
}

fn push_unique(list: &mut Vec<String>, column: &str) {
    if !list.iter().any(|c| c == column) {
        list.push(column.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan::{
        AggregateFunction, FilterOperator, OrderDirection, PlannerAggregate, PlannerFilter,
        PlannerOrder, PlannerWindow, WindowFunction,
    };
    use crate::schema::PlannerField;
    use crate::source::SourceType;

    fn ctx() -> PlannerSchemaContext {
        let fields = vec![
            ("customer", FieldType::String, false),
            ("amount", FieldType::Number, true),
            ("status", FieldType::String, false),
            ("created_at", FieldType::DateTime, false),
        ]
        .into_iter()
        .map(|(name, field_type, nullable)| PlannerField {
            column: name.to_string(),
            field_type,
            nullable,
            description: None,
        })
        .collect();
        PlannerSchemaContext {
            source_type: SourceType::Postgres,
            source_name: "warehouse".to_string(),
            table_name: "orders".to_string(),
            fields,
        }
    }

    fn empty_plan() -> QueryPlan {
        QueryPlan {
            select: vec![],
            filters: vec![],
            aggregations: vec![],
            group_by: vec![],
            order_by: vec![],
            window: None,
            limit: None,
            rationale: String::new(),
        }
    }

    #[test]
    fn test_ungrouped_select_is_blocking() {
        let mut plan = empty_plan();
        plan.select = vec!["customer".to_string(), "status".to_string()];
        plan.group_by = vec!["customer".to_string()];
        plan.aggregations = vec![PlannerAggregate {
            function: AggregateFunction::Sum,
            column: "amount".to_string(),
            alias: "total".to_string(),
        }];
        let result = validate_safety(&ctx(), &plan);
        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].contains("status"));
    }

    #[test]
    fn test_grouped_plan_passes() {
        let mut plan = empty_plan();
        plan.select = vec!["customer".to_string()];
        plan.group_by = vec!["customer".to_string()];
        plan.aggregations = vec![PlannerAggregate {
            function: AggregateFunction::Sum,
            column: "amount".to_string(),
            alias: "total_revenue".to_string(),
        }];
        let result = validate_safety(&ctx(), &plan);
        assert!(result.issues.is_empty());
        // amount is nullable, so it lands on the coalesce list.
        assert_eq!(result.null_safe_columns, vec!["amount"]);
        assert!(result.numeric_cast_columns.is_empty());
    }

    #[test]
    fn test_window_without_order_is_blocking() {
        let mut plan = empty_plan();
        plan.window = Some(PlannerWindow {
            function: WindowFunction::RunningSum,
            column: "amount".to_string(),
            alias: "running_amount".to_string(),
            partition_by: vec![],
            order_by: None,
            frame: None,
        });
        let result = validate_safety(&ctx(), &plan);
        assert!(result.issues.iter().any(|i| i.contains("ORDER BY")));
    }

    #[test]
    fn test_window_unknown_column_is_blocking() {
        let mut plan = empty_plan();
        plan.window = Some(PlannerWindow {
            function: WindowFunction::RunningSum,
            column: "phantom".to_string(),
            alias: "x".to_string(),
            partition_by: vec![],
            order_by: Some(PlannerOrder {
                column: "created_at".to_string(),
                direction: OrderDirection::Asc,
            }),
            frame: None,
        });
        let result = validate_safety(&ctx(), &plan);
        assert!(result.issues.iter().any(|i| i.contains("phantom")));
    }

    #[test]
    fn test_string_comparison_warns() {
        let mut plan = empty_plan();
        plan.filters = vec![PlannerFilter {
            column: "status".to_string(),
            operator: FilterOperator::Gt,
            value: Some(serde_json::json!("active")),
            value_type: None,
        }];
        let result = validate_safety(&ctx(), &plan);
        assert!(result.issues.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_numeric_cast_for_string_sum() {
        let mut plan = empty_plan();
        plan.aggregations = vec![PlannerAggregate {
            function: AggregateFunction::Sum,
            column: "status".to_string(),
            alias: "weird".to_string(),
        }];
        let result = validate_safety(&ctx(), &plan);
        assert_eq!(result.numeric_cast_columns, vec!["status"]);
    }

    #[test]
    fn test_window_plus_aggregations_warns() {
        let mut plan = empty_plan();
        plan.aggregations = vec![PlannerAggregate {
            function: AggregateFunction::Count,
            column: "*".to_string(),
            alias: "n".to_string(),
        }];
        plan.window = Some(PlannerWindow {
            function: WindowFunction::RunningCount,
            column: "*".to_string(),
            alias: "running_n".to_string(),
            partition_by: vec![],
            order_by: Some(PlannerOrder {
                column: "created_at".to_string(),
                direction: OrderDirection::Asc,
            }),
            frame: None,
        });
        let result = validate_safety(&ctx(), &plan);
        assert!(result.warnings.iter().any(|w| w.contains("window")));
    }
}
