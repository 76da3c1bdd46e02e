//! Failure classification and repair hints
//!
//! Transient-error detection for in-place retries, and the repair hint
//! builder that recognizes known failure signatures and feeds targeted
//! instructions back into Phase 2.

lazy_static::lazy_static! {
    static ref TRANSIENT_MARKERS: Vec<&'static str> = vec![
        "502",
        "503",
        "504",
        "bad gateway",
        "fetch failed",
        "network",
        "socket",
        "econnreset",
        "econnrefused",
        "timeout",
        "timed out",
        "temporarily unavailable",
    ];
}

/// Errors safe to retry in place, without re-planning.
pub fn is_transient_execution_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Build the repair hint appended to the Phase-2 prompt on the single
/// whole-pipeline re-run. Known failure signatures get targeted
/// instructions; the literal failing SQL is always attached.
pub fn build_repair_hint(error_message: &str, failing_sql: Option<&str>) -> String {
    let lowered = error_message.to_lowercase();
    let mut instructions: Vec<&str> = Vec::new();

    if lowered.contains("groby") || lowered.contains("grob ") {
        instructions.push("Spell the grouping clause exactly as GROUP BY.");
    }
    if lowered.contains("datediff") {
        instructions.push("Use DATE_DIFF (with an underscore) for date arithmetic on BigQuery.");
    }
    if lowered.contains("'date_sub") || lowered.contains("function literal") {
        instructions.push("Do not wrap function expressions like DATE_SUB(...) in quotes; they are not string literals.");
    }
    if lowered.contains("group by")
        || lowered.contains("not in group")
        || lowered.contains("neither grouped nor aggregated")
        || lowered.contains("must appear in the group by")
    {
        instructions.push("Every selected column that is not aggregated must be listed in group_by.");
    }
    if lowered.contains("division") || lowered.contains("divide") {
        instructions.push("Aggregate both operands to scalars before dividing; never divide a column by an aggregate.");
    }
    if is_transient_execution_error(error_message) {
        instructions.push("The previous failure was a transient network error; keep the plan simple and deterministic.");
    }

    let mut parts = vec![format!("Execution failed with: {}", error_message)];
    for instruction in instructions {
        parts.push(format!("- {}", instruction));
    }
    if let Some(sql) = failing_sql {
        parts.push(format!("Failing SQL:\n{}", sql));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_execution_error("HTTP 503 Service Unavailable"));
        assert!(is_transient_execution_error("fetch failed"));
        assert!(is_transient_execution_error("read ECONNRESET"));
        assert!(is_transient_execution_error("connection timed out"));
        assert!(!is_transient_execution_error("column \"ghost\" does not exist"));
        assert!(!is_transient_execution_error("syntax error at or near FROM"));
    }

    #[test]
    fn test_repair_hint_recognizes_group_by_failures() {
        let hint = build_repair_hint(
            "column \"customer\" must appear in the GROUP BY clause or be used in an aggregate function",
            Some("SELECT customer, SUM(amount) FROM orders"),
        );
        assert!(hint.contains("listed in group_by"));
        assert!(hint.contains("Failing SQL:"));
        assert!(hint.contains("SELECT customer, SUM(amount) FROM orders"));
    }

    #[test]
    fn test_repair_hint_recognizes_datediff() {
        let hint = build_repair_hint("Function not found: DATEDIFF", None);
        assert!(hint.contains("DATE_DIFF"));
    }

    #[test]
    fn test_repair_hint_always_carries_error() {
        let hint = build_repair_hint("something novel went wrong", None);
        assert!(hint.contains("something novel went wrong"));
    }
}
