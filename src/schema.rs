//! Schema adapter
//!
//! Normalizes an arbitrary source's introspected schema into a canonical
//! `{table -> fields}` map with a reduced type lattice, and produces the
//! compact textual summary fed to the completion capability.

use crate::config::PlannerConfig;
use crate::error::{PlannerError, Result};
use crate::source::{SourceConfig, SourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Reduced type lattice shared by the planner phases and SQL generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    DateTime,
    Unknown,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Unknown => "unknown",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Number)
    }
}

/// Map a source type string onto the reduced lattice.
///
/// Exact-match after lowercase/trim: parameterized names such as
/// `varchar(255)` fall through to `unknown`. Kept for behavioral parity with
/// the introspection layer this replaces.
pub fn normalize_field_type(raw: &str) -> FieldType {
    match raw.trim().to_lowercase().as_str() {
        "int" | "integer" | "int2" | "int4" | "int8" | "int64" | "bigint" | "smallint"
        | "tinyint" | "numeric" | "decimal" | "float" | "float4" | "float8" | "float64"
        | "double" | "double precision" | "real" | "number" => FieldType::Number,
        "bool" | "boolean" => FieldType::Boolean,
        "timestamp" | "timestamptz" | "datetime" | "timestamp with time zone"
        | "timestamp without time zone" => FieldType::DateTime,
        "date" => FieldType::Date,
        "text" | "varchar" | "char" | "character" | "character varying" | "string" => {
            FieldType::String
        }
        _ => FieldType::Unknown,
    }
}

/// Raw introspected column, as cached by the source service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub nullable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaTable {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
}

/// Per-source schema snapshot owned by the external source service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCache {
    pub tables: Vec<SchemaTable>,
}

/// Canonical field derived once per planning call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerField {
    pub column: String,
    pub field_type: FieldType,
    pub nullable: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Planning context scoped to exactly one table.
#[derive(Debug, Clone)]
pub struct PlannerSchemaContext {
    pub source_type: SourceType,
    pub source_name: String,
    pub table_name: String,
    pub fields: Vec<PlannerField>,
}

impl PlannerSchemaContext {
    pub fn field(&self, column: &str) -> Option<&PlannerField> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn has_field(&self, column: &str) -> bool {
        self.field(column).is_some()
    }
}

/// Normalized schema for one source: table list, full field map, and the
/// bounded textual summary used for prompting.
#[derive(Debug, Clone)]
pub struct SchemaBundle {
    pub tables: Vec<String>,
    pub fields_by_table: HashMap<String, Vec<PlannerField>>,
    pub schema_text: String,
}

impl SchemaBundle {
    pub fn context_for(&self, source: &SourceConfig, table_name: &str) -> Result<PlannerSchemaContext> {
        let fields = self
            .fields_by_table
            .get(table_name)
            .cloned()
            .ok_or_else(|| {
                PlannerError::Execution(format!("Table '{}' not present in schema bundle", table_name))
            })?;
        Ok(PlannerSchemaContext {
            source_type: source.source_type,
            source_name: source.name.clone(),
            table_name: table_name.to_string(),
            fields,
        })
    }
}

/// Build the canonical schema bundle for a planning call.
///
/// Tables with zero resolvable columns are dropped. The textual summary is
/// bounded (table and per-table column caps from the config); the full field
/// map is retained regardless of the preview caps.
pub fn build_schema_bundle(
    source: &SourceConfig,
    cache: &SchemaCache,
    config: &PlannerConfig,
) -> Result<SchemaBundle> {
    let mut tables = Vec::new();
    let mut fields_by_table = HashMap::new();

    for table in &cache.tables {
        let fields: Vec<PlannerField> = table
            .columns
            .iter()
            .filter(|c| !c.name.trim().is_empty())
            .map(|c| PlannerField {
                column: c.name.clone(),
                field_type: normalize_field_type(&c.column_type),
                nullable: c.nullable.unwrap_or(true),
                description: None,
            })
            .collect();

        if fields.is_empty() {
            debug!("Dropping table '{}' with no resolvable columns", table.name);
            continue;
        }

        let effective_name = effective_table_name(source, &table.name);
        tables.push(effective_name.clone());
        fields_by_table.insert(effective_name, fields);
    }

    if tables.is_empty() {
        return Err(PlannerError::NoSchema(format!(
            "Source '{}' has no introspected tables; run schema introspection first",
            source.name
        )));
    }

    let schema_text = render_schema_text(&tables, &fields_by_table, config);

    Ok(SchemaBundle {
        tables,
        fields_by_table,
        schema_text,
    })
}

/// Sheets-as-warehouse sources address a fully-qualified external table
/// when one is configured. This is the only source-type-specific branch in
/// schema assembly.
fn effective_table_name(source: &SourceConfig, introspected: &str) -> String {
    if source.source_type == SourceType::SheetsBigQuery {
        if let Some(ref qualified) = source.sheets_qualified_table {
            if !qualified.trim().is_empty() {
                return qualified.clone();
            }
        }
    }
    introspected.to_string()
}

fn render_schema_text(
    tables: &[String],
    fields_by_table: &HashMap<String, Vec<PlannerField>>,
    config: &PlannerConfig,
) -> String {
    let mut lines = Vec::new();

    for table_name in tables.iter().take(config.schema_table_cap) {
        let fields = &fields_by_table[table_name];
        lines.push(format!("Table {} ({} columns):", table_name, fields.len()));
        for field in fields.iter().take(config.schema_column_preview_cap) {
            let nullable = if field.nullable { ", nullable" } else { "" };
            lines.push(format!("  - {}: {}{}", field.column, field.field_type.as_str(), nullable));
        }
        if fields.len() > config.schema_column_preview_cap {
            lines.push(format!(
                "  ... {} more columns omitted",
                fields.len() - config.schema_column_preview_cap
            ));
        }
    }

    if tables.len() > config.schema_table_cap {
        lines.push(format!(
            "... {} more tables omitted",
            tables.len() - config.schema_table_cap
        ));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(source_type: SourceType) -> SourceConfig {
        SourceConfig {
            id: "src-1".to_string(),
            name: "warehouse".to_string(),
            source_type,
            sheets_qualified_table: None,
            user_notes: None,
            inferred_notes: None,
            memory_rules: vec![],
            mcp_provider: None,
            mcp_server_name: None,
        }
    }

    fn cache(tables: Vec<(&str, Vec<(&str, &str)>)>) -> SchemaCache {
        SchemaCache {
            tables: tables
                .into_iter()
                .map(|(name, cols)| SchemaTable {
                    name: name.to_string(),
                    columns: cols
                        .into_iter()
                        .map(|(n, t)| SchemaColumn {
                            name: n.to_string(),
                            column_type: t.to_string(),
                            nullable: Some(false),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_type_lattice() {
        assert_eq!(normalize_field_type("BIGINT"), FieldType::Number);
        assert_eq!(normalize_field_type("timestamp"), FieldType::DateTime);
        assert_eq!(normalize_field_type("date"), FieldType::Date);
        assert_eq!(normalize_field_type("bool"), FieldType::Boolean);
        assert_eq!(normalize_field_type("varchar"), FieldType::String);
        // Exact-match lattice: parameterized names fall through.
        assert_eq!(normalize_field_type("varchar(255)"), FieldType::Unknown);
        assert_eq!(normalize_field_type("geometry"), FieldType::Unknown);
    }

    #[test]
    fn test_empty_tables_dropped() {
        let bundle = build_schema_bundle(
            &source(SourceType::Postgres),
            &cache(vec![
                ("orders", vec![("id", "bigint")]),
                ("empty_view", vec![]),
            ]),
            &PlannerConfig::default(),
        )
        .unwrap();
        assert_eq!(bundle.tables, vec!["orders".to_string()]);
    }

    #[test]
    fn test_no_schema_is_fatal() {
        let err = build_schema_bundle(
            &source(SourceType::Postgres),
            &cache(vec![("empty", vec![])]),
            &PlannerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PlannerError::NoSchema(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sheets_qualified_override() {
        let mut src = source(SourceType::SheetsBigQuery);
        src.sheets_qualified_table = Some("proj.dataset.sheet1".to_string());
        let bundle = build_schema_bundle(
            &src,
            &cache(vec![("Sheet1", vec![("amount", "FLOAT64")])]),
            &PlannerConfig::default(),
        )
        .unwrap();
        assert_eq!(bundle.tables, vec!["proj.dataset.sheet1".to_string()]);
        assert!(bundle.fields_by_table.contains_key("proj.dataset.sheet1"));
    }

    #[test]
    fn test_column_preview_cap() {
        let columns: Vec<(String, String)> =
            (0..40).map(|i| (format!("c{}", i), "text".to_string())).collect();
        let table = SchemaTable {
            name: "wide".to_string(),
            columns: columns
                .iter()
                .map(|(n, t)| SchemaColumn {
                    name: n.clone(),
                    column_type: t.clone(),
                    nullable: None,
                })
                .collect(),
        };
        let bundle = build_schema_bundle(
            &source(SourceType::Postgres),
            &SchemaCache { tables: vec![table] },
            &PlannerConfig::default(),
        )
        .unwrap();
        assert!(bundle.schema_text.contains("10 more columns omitted"));
        // Full field list retained regardless of the preview cap.
        assert_eq!(bundle.fields_by_table["wide"].len(), 40);
    }
}
