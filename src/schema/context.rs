//! Schema rendering for LLM prompts.

use crate::schema::model::{DatabaseSchema, TableKind};
use std::fmt::Write;

const MAX_SAMPLE_ROWS: usize = 2;

/// Map a SQL Server type name to the DAX data type shown to the model.
pub fn map_sql_to_dax_type(sql_type: &str) -> &'static str {
    let ty = sql_type.to_lowercase();
    let base = ty.split('(').next().unwrap_or("").trim();
    match base {
        "int" | "bigint" | "smallint" | "tinyint" => "Integer",
        "decimal" | "numeric" | "float" | "real" => "Decimal",
        "money" | "smallmoney" => "Currency",
        "varchar" | "nvarchar" | "char" | "nchar" | "text" | "ntext" => "Text",
        "date" => "Date",
        "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => "DateTime",
        "time" => "Time",
        "bit" => "Boolean",
        _ => "Text",
    }
}

/// T-SQL oriented context: qualified names, types, keys, sample rows and joins.
pub fn sql_context(schema: &DatabaseSchema) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Database: {}", schema.database);
    let _ = writeln!(out, "Tables:");

    for table in &schema.tables {
        let _ = writeln!(out);
        if table.kind == TableKind::Unknown {
            let _ = writeln!(out, "Table: [{}].[{}]", table.schema, table.name);
        } else {
            let _ = writeln!(out, "Table: [{}].[{}] ({} table)", table.schema, table.name, table.kind);
        }
        let _ = writeln!(out, "Columns:");
        for col in &table.columns {
            let mut line = format!("  - {} {}", col.name, col.display_type());
            if !col.is_nullable {
                line.push_str(" NOT NULL");
            }
            if table.primary_key.iter().any(|pk| pk.eq_ignore_ascii_case(&col.name)) {
                line.push_str(" PRIMARY KEY");
            }
            let _ = writeln!(out, "{}", line);
        }
        if !table.sample_data.is_empty() {
            let _ = writeln!(out, "Sample data:");
            for row in table.sample_data.iter().take(MAX_SAMPLE_ROWS) {
                let _ = writeln!(out, "  {}", serde_json::Value::Object(row.clone()));
            }
        }
    }

    if !schema.relationships.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Relationships:");
        for rel in &schema.relationships {
            let _ = writeln!(
                out,
                "  {}.{} -> {}.{}",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column
            );
        }
    }
    out
}

/// DAX oriented context: `'Table'[Column] : Type` and model relationships.
pub fn dax_context(schema: &DatabaseSchema) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Model tables:");

    for table in &schema.tables {
        let _ = writeln!(out);
        match table.kind {
            TableKind::Unknown => {
                let _ = writeln!(out, "'{}'", table.name);
            }
            kind => {
                let _ = writeln!(out, "'{}' ({} table)", table.name, kind);
            }
        }
        for col in &table.columns {
            let _ = writeln!(
                out,
                "  '{}'[{}] : {}",
                table.name,
                col.name,
                map_sql_to_dax_type(&col.data_type)
            );
        }
    }

    if !schema.relationships.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Relationships (many -> one):");
        for rel in &schema.relationships {
            let _ = writeln!(
                out,
                "  '{}'[{}] -> '{}'[{}]",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column
            );
        }
    }
    out
}
