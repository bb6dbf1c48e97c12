//! Query Result - Standardized result format from executors

use crate::error::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

pub type Row = serde_json::Map<String, Value>;

/// Standardized query result from any executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    /// Success status
    pub success: bool,

    /// Column names, in result order
    pub columns: Vec<String>,

    /// Result rows keyed by column name
    pub rows: Vec<Row>,

    /// Number of rows returned
    pub row_count: usize,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,

    /// Executor that ran the query
    pub engine: String,

    pub error: Option<String>,

    /// Warnings (non-fatal issues)
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl QueryResult {
    /// Create a successful result. Columns default to the first row's keys.
    pub fn ok(engine: impl Into<String>, columns: Vec<String>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        let columns = if columns.is_empty() {
            rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default()
        } else {
            columns
        };
        Self {
            success: true,
            row_count: rows.len(),
            columns,
            rows,
            execution_time_ms,
            engine: engine.into(),
            error: None,
            warnings: Vec::new(),
        }
    }

    /// Create an error result
    pub fn failed(engine: impl Into<String>, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms,
            engine: engine.into(),
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Build a DataFrame, inferring each column as integer, float, boolean or string.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let series: Vec<Series> = self
            .columns
            .iter()
            .map(|name| {
                let values: Vec<&Value> = self
                    .rows
                    .iter()
                    .map(|row| row.get(name).unwrap_or(&Value::Null))
                    .collect();
                column_to_series(name, &values)
            })
            .collect();
        Ok(DataFrame::new(series)?)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut df = self.to_dataframe()?;
        let mut file = std::fs::File::create(path)?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
        Ok(())
    }
}

fn column_to_series(name: &str, values: &[&Value]) -> Series {
    let non_null = values.iter().filter(|v| !v.is_null());

    if non_null.clone().all(|v| v.is_i64()) {
        let data: Vec<Option<i64>> = values.iter().map(|v| v.as_i64()).collect();
        return Series::new(name, data);
    }
    if non_null.clone().all(|v| v.is_number()) {
        let data: Vec<Option<f64>> = values.iter().map(|v| v.as_f64()).collect();
        return Series::new(name, data);
    }
    if non_null.clone().all(|v| v.is_boolean()) {
        let data: Vec<Option<bool>> = values.iter().map(|v| v.as_bool()).collect();
        return Series::new(name, data);
    }
    let data: Vec<Option<String>> = values
        .iter()
        .map(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect();
    Series::new(name, data)
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.success {
            return write!(
                f,
                "[{}] query failed: {}",
                self.engine,
                self.error.as_deref().unwrap_or("unknown error")
            );
        }
        if self.columns.is_empty() {
            return write!(f, "[{}] no rows ({} ms)", self.engine, self.execution_time_ms);
        }
        match self.to_dataframe() {
            Ok(df) => {
                writeln!(f, "{}", df)?;
                write!(f, "{} rows in {} ms ({})", self.row_count, self.execution_time_ms, self.engine)
            }
            Err(e) => write!(f, "[{}] {} rows (table rendering failed: {})", self.engine, self.row_count, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_columns_default_to_first_row() {
        let result = QueryResult::ok(
            "test",
            vec![],
            vec![row(json!({"name": "A", "total": 1})), row(json!({"name": "B", "total": 2}))],
            5,
        );
        assert_eq!(result.columns, vec!["name", "total"]);
        assert_eq!(result.row_count, 2);
    }

    #[test]
    fn test_to_dataframe_infers_types() {
        let result = QueryResult::ok(
            "test",
            vec![],
            vec![
                row(json!({"id": 1, "amount": 1.5, "active": true, "name": "A"})),
                row(json!({"id": null, "amount": 2, "active": false, "name": 7})),
            ],
            0,
        );
        let df = result.to_dataframe().unwrap();
        assert_eq!(df.shape(), (2, 4));
        assert_eq!(df.column("id").unwrap().dtype(), &DataType::Int64);
        assert_eq!(df.column("amount").unwrap().dtype(), &DataType::Float64);
        assert_eq!(df.column("active").unwrap().dtype(), &DataType::Boolean);
        assert_eq!(df.column("name").unwrap().dtype(), &DataType::String);
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/result.csv");
        let result = QueryResult::ok("test", vec![], vec![row(json!({"a": 1, "b": "x"}))], 0);
        result.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("a,b"));
        assert!(text.contains("1,x"));
    }

    #[test]
    fn test_failed_display() {
        let result = QueryResult::failed("azure-sql", "boom", 3);
        assert!(!result.success);
        assert_eq!(result.to_string(), "[azure-sql] query failed: boom");
    }
}
