//! Schema discovery through INFORMATION_SCHEMA.
//!
//! Works over any SQL [`QueryExecutor`], so tests and alternative SQL sources
//! share the same discovery path as Azure SQL.

use crate::error::{PipelineError, Result};
use crate::execution::engine::{QueryExecutor, QueryLanguage};
use crate::execution::result::Row;
use crate::schema::model::{ColumnInfo, DatabaseSchema, Relationship, TableInfo};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const TABLES_QUERY: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE \
     FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_TYPE IN ('BASE TABLE', 'VIEW') \
     ORDER BY TABLE_SCHEMA, TABLE_NAME";

const COLUMNS_QUERY: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, DATA_TYPE, \
     CHARACTER_MAXIMUM_LENGTH, IS_NULLABLE, ORDINAL_POSITION \
     FROM INFORMATION_SCHEMA.COLUMNS \
     ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION";

const PRIMARY_KEYS_QUERY: &str = "SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME \
     FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
     JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku \
       ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA \
     WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
     ORDER BY ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.ORDINAL_POSITION";

const FOREIGN_KEYS_QUERY: &str = "SELECT fk.TABLE_NAME AS FROM_TABLE, fk.COLUMN_NAME AS FROM_COLUMN, \
     pk.TABLE_NAME AS TO_TABLE, pk.COLUMN_NAME AS TO_COLUMN \
     FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc \
     JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE fk \
       ON rc.CONSTRAINT_NAME = fk.CONSTRAINT_NAME AND rc.CONSTRAINT_SCHEMA = fk.CONSTRAINT_SCHEMA \
     JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE pk \
       ON rc.UNIQUE_CONSTRAINT_NAME = pk.CONSTRAINT_NAME AND rc.UNIQUE_CONSTRAINT_SCHEMA = pk.CONSTRAINT_SCHEMA \
      AND fk.ORDINAL_POSITION = pk.ORDINAL_POSITION \
     ORDER BY fk.TABLE_NAME, fk.COLUMN_NAME";

const SAMPLE_ROWS: usize = 3;

fn text(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn integer(row: &Row, key: &str) -> Option<i64> {
    match row.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required(row: &Row, key: &str) -> Result<String> {
    text(row, key).ok_or_else(|| PipelineError::Schema(format!("Discovery row is missing {}", key)))
}

/// `[schema].[name]` with closing brackets escaped.
fn bracketed(schema: &str, name: &str) -> String {
    format!("[{}].[{}]", schema.replace(']', "]]"), name.replace(']', "]]"))
}

pub struct SchemaDiscovery<'a> {
    executor: &'a dyn QueryExecutor,
    database: String,
    sample_rows: usize,
}

impl<'a> SchemaDiscovery<'a> {
    pub fn new(executor: &'a dyn QueryExecutor, database: impl Into<String>) -> Self {
        Self {
            executor,
            database: database.into(),
            sample_rows: SAMPLE_ROWS,
        }
    }

    pub fn with_sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let result = self.executor.execute(sql).await?;
        if !result.success {
            return Err(PipelineError::Schema(
                result.error.unwrap_or_else(|| "discovery query failed".to_string()),
            ));
        }
        Ok(result.rows)
    }

    pub async fn discover(&self) -> Result<DatabaseSchema> {
        if self.executor.language() != QueryLanguage::Sql {
            return Err(PipelineError::Schema(format!(
                "Schema discovery needs a SQL executor, got {}",
                self.executor.name()
            )));
        }
        info!("Discovering schema of {}", self.database);

        let mut tables: Vec<TableInfo> = Vec::new();
        for row in self.query(TABLES_QUERY).await? {
            let mut table = TableInfo::new(required(&row, "TABLE_NAME")?, Vec::new());
            if let Some(schema) = text(&row, "TABLE_SCHEMA") {
                table.schema = schema;
            }
            tables.push(table);
        }

        let index: HashMap<(String, String), usize> = tables
            .iter()
            .enumerate()
            .map(|(i, t)| ((t.schema.to_lowercase(), t.name.to_lowercase()), i))
            .collect();
        let key = |row: &Row| -> Result<(String, String)> {
            Ok((
                text(row, "TABLE_SCHEMA").unwrap_or_else(|| "dbo".to_string()).to_lowercase(),
                required(row, "TABLE_NAME")?.to_lowercase(),
            ))
        };

        for row in self.query(COLUMNS_QUERY).await? {
            let Some(&i) = index.get(&key(&row)?) else {
                continue;
            };
            let mut column = ColumnInfo::new(required(&row, "COLUMN_NAME")?, required(&row, "DATA_TYPE")?);
            column.max_length = integer(&row, "CHARACTER_MAXIMUM_LENGTH");
            column.is_nullable = text(&row, "IS_NULLABLE").map_or(true, |v| v.eq_ignore_ascii_case("YES"));
            tables[i].columns.push(column);
        }

        for row in self.query(PRIMARY_KEYS_QUERY).await? {
            if let Some(&i) = index.get(&key(&row)?) {
                tables[i].primary_key.push(required(&row, "COLUMN_NAME")?);
            }
        }

        let mut relationships = Vec::new();
        for row in self.query(FOREIGN_KEYS_QUERY).await? {
            relationships.push(Relationship::new(
                required(&row, "FROM_TABLE")?,
                required(&row, "FROM_COLUMN")?,
                required(&row, "TO_TABLE")?,
                required(&row, "TO_COLUMN")?,
            ));
        }

        let tables = focus_star_schema(tables);

        let mut schema = DatabaseSchema::new(self.database.clone());
        schema.relationships = relationships
            .into_iter()
            .filter(|r| {
                let known = |name: &str| tables.iter().any(|t| t.name.eq_ignore_ascii_case(name));
                known(&r.from_table) && known(&r.to_table)
            })
            .collect();
        schema.tables = tables;

        if self.sample_rows > 0 {
            for table in schema.tables.iter_mut() {
                let sql = format!("SELECT TOP {} * FROM {}", self.sample_rows, bracketed(&table.schema, &table.name));
                match self.query(&sql).await {
                    Ok(rows) => table.sample_data = rows,
                    Err(e) => warn!("Skipping sample rows of {}: {}", table.full_name(), e),
                }
            }
        }

        schema.classify_tables();
        let summary = schema.summary();
        info!(
            "Discovered {} tables ({} fact, {} dimension, {} relationships, {} schema)",
            summary.total_tables,
            summary.fact_tables.len(),
            summary.dimension_tables.len(),
            summary.relationship_count,
            summary.schema_type
        );
        Ok(schema)
    }
}

/// Keep only `*FACT*` and `*DIMENSION*` tables when the database has both.
fn focus_star_schema(tables: Vec<TableInfo>) -> Vec<TableInfo> {
    let is_fact = |t: &TableInfo| t.name.to_uppercase().contains("FACT");
    let is_dim = |t: &TableInfo| t.name.to_uppercase().contains("DIMENSION");
    if tables.iter().any(is_fact) && tables.iter().any(is_dim) {
        let before = tables.len();
        let kept: Vec<TableInfo> = tables.into_iter().filter(|t| is_fact(t) || is_dim(t)).collect();
        debug!("Star-schema focus kept {} of {} tables", kept.len(), before);
        kept
    } else {
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::result::QueryResult;
    use crate::schema::TableKind;
    use async_trait::async_trait;
    use serde_json::json;

    struct CatalogExecutor;

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()
    }

    #[async_trait]
    impl QueryExecutor for CatalogExecutor {
        fn name(&self) -> &'static str {
            "catalog"
        }

        fn language(&self) -> QueryLanguage {
            QueryLanguage::Sql
        }

        async fn execute(&self, query: &str) -> Result<QueryResult> {
            let data = if query.contains("INFORMATION_SCHEMA.TABLES WHERE") {
                rows(vec![
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "TABLE_TYPE": "BASE TABLE"}),
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "TABLE_TYPE": "BASE TABLE"}),
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "sysdiagrams", "TABLE_TYPE": "BASE TABLE"}),
                ])
            } else if query.contains("CHARACTER_MAXIMUM_LENGTH") {
                rows(vec![
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "COLUMN_NAME": "CUSTOMER_KEY", "DATA_TYPE": "int", "CHARACTER_MAXIMUM_LENGTH": null, "IS_NULLABLE": "NO"}),
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "COLUMN_NAME": "CUSTOMER_NAME", "DATA_TYPE": "varchar", "CHARACTER_MAXIMUM_LENGTH": 100, "IS_NULLABLE": "YES"}),
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "COLUMN_NAME": "CUSTOMER_KEY", "DATA_TYPE": "int", "CHARACTER_MAXIMUM_LENGTH": null, "IS_NULLABLE": "NO"}),
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "COLUMN_NAME": "PRINCIPAL_AMOUNT", "DATA_TYPE": "decimal", "CHARACTER_MAXIMUM_LENGTH": null, "IS_NULLABLE": "YES"}),
                    json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "sysdiagrams", "COLUMN_NAME": "definition", "DATA_TYPE": "varbinary", "CHARACTER_MAXIMUM_LENGTH": -1, "IS_NULLABLE": "YES"}),
                ])
            } else if query.contains("PRIMARY KEY") {
                rows(vec![json!({"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "COLUMN_NAME": "CUSTOMER_KEY"})])
            } else if query.contains("REFERENTIAL_CONSTRAINTS") {
                rows(vec![json!({"FROM_TABLE": "FACT_LOAN", "FROM_COLUMN": "CUSTOMER_KEY", "TO_TABLE": "CUSTOMER_DIMENSION", "TO_COLUMN": "CUSTOMER_KEY"})])
            } else if query.contains("[FACT_LOAN]") {
                return Ok(QueryResult::failed("catalog", "permission denied", 0));
            } else if query.contains("[CUSTOMER_DIMENSION]") {
                rows(vec![json!({"CUSTOMER_KEY": 1, "CUSTOMER_NAME": "Acme"})])
            } else {
                return Err(PipelineError::Execution(format!("unexpected query: {}", query)));
            };
            Ok(QueryResult::ok("catalog", Vec::new(), data, 1))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_discover_star_schema() {
        let executor = CatalogExecutor;
        let schema = SchemaDiscovery::new(&executor, "banking").discover().await.unwrap();

        assert_eq!(schema.tables.len(), 2, "sysdiagrams should be dropped");
        let dim = schema.table("CUSTOMER_DIMENSION").unwrap();
        assert_eq!(dim.kind, TableKind::Dimension);
        assert_eq!(dim.primary_key, vec!["CUSTOMER_KEY"]);
        assert_eq!(dim.columns[1].max_length, Some(100));
        assert!(!dim.columns[0].is_nullable);
        assert_eq!(dim.sample_data.len(), 1);

        let fact = schema.table("FACT_LOAN").unwrap();
        assert_eq!(fact.kind, TableKind::Fact);
        assert!(fact.sample_data.is_empty());
        assert_eq!(schema.relationships.len(), 1);
    }

    #[test]
    fn test_focus_keeps_everything_without_both_groups() {
        let tables = vec![TableInfo::new("ORDERS", Vec::new()), TableInfo::new("FACT_X", Vec::new())];
        assert_eq!(focus_star_schema(tables).len(), 2);
    }

    #[test]
    fn test_bracketed() {
        assert_eq!(bracketed("dbo", "odd]name"), "[dbo].[odd]]name]");
    }
}
