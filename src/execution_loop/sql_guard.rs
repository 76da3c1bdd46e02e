//! SQL guards
//!
//! Runtime enforcement that generated SQL is read-only, plus the small
//! dialect-repair pass and the user-limit heuristic. These operate on text
//! because review and repair can reintroduce artifacts after the
//! deterministic generator has run.

use crate::error::{PlannerError, Result};
use crate::llm::strip_code_fences;
use crate::planner::sqlgen::SqlDialect;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DML_DDL_RE: Regex = Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|truncate|create|grant|revoke)\b"
    )
    .unwrap();

    // Limit heuristics. The bare `\blimit\b` word is a documented false
    // positive ("limit exposure to risk").
    static ref TOP_N_RE: Regex = Regex::new(r"(?i)\b(top|first|last)\s+\d+\b").unwrap();
    static ref LIMIT_WORD_RE: Regex = Regex::new(r"(?i)\blimit\b").unwrap();
    static ref SHOW_N_RE: Regex = Regex::new(
        r"(?i)\b(show|list|return|give)\s+(me\s+)?(the\s+)?\d+\s+(rows?|records?|results?|entries|items|customers?|orders?|products?|users?)\b"
    )
    .unwrap();
    static ref PREVIEW_RE: Regex = Regex::new(r"(?i)\bpreview\b").unwrap();

    static ref GROBY_RE: Regex = Regex::new(r"(?i)\bGROBY?\b").unwrap();
    static ref QUOTED_DATE_SUB_RE: Regex = Regex::new(r"'(DATE_SUB\([^']*\))'").unwrap();
    static ref DATEDIFF_RE: Regex = Regex::new(r"(?i)\bDATEDIFF\b").unwrap();
}

/// Gate a statement to non-empty, read-only SQL.
///
/// Strips code fences and trailing semicolons, requires the statement to
/// start with SELECT or WITH, and rejects any DML/DDL keyword anywhere.
/// This is the sole runtime read-only enforcement, independent of the
/// deterministic generator's behavior.
pub fn sanitize_sql(sql: &str) -> Result<String> {
    let cleaned = strip_code_fences(sql).trim_end_matches(';').trim().to_string();

    if cleaned.is_empty() {
        return Err(PlannerError::SqlSanitization("Empty statement".to_string()));
    }

    let upper = cleaned.to_uppercase();
    if !upper.starts_with("SELECT") && !upper.starts_with("WITH") {
        return Err(PlannerError::SqlSanitization(format!(
            "Statement must start with SELECT or WITH: {}",
            truncate(&cleaned, 120)
        )));
    }

    if let Some(found) = DML_DDL_RE.find(&cleaned) {
        return Err(PlannerError::SqlSanitization(format!(
            "Write keyword '{}' is not allowed",
            found.as_str()
        )));
    }

    Ok(cleaned)
}

/// Textual dialect-repair pass applied before preflight: misspelled
/// GROUP BY, accidentally-quoted DATE_SUB expressions, and DATEDIFF on
/// BigQuery-family dialects.
pub fn normalize_sql_for_dialect(sql: &str, dialect: SqlDialect) -> String {
    let mut normalized = GROBY_RE.replace_all(sql, "GROUP BY").to_string();
    normalized = QUOTED_DATE_SUB_RE.replace_all(&normalized, "$1").to_string();
    if dialect.is_bigquery_family() {
        normalized = DATEDIFF_RE.replace_all(&normalized, "DATE_DIFF").to_string();
    }
    normalized
}

/// Regex heuristic: did the user's message textually ask for a bounded
/// result? Governs whether a plan's proposed limit is honored or nulled.
pub fn user_requested_limit(message: &str) -> bool {
    TOP_N_RE.is_match(message)
        || LIMIT_WORD_RE.is_match(message)
        || SHOW_N_RE.is_match(message)
        || PREVIEW_RE.is_match(message)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
