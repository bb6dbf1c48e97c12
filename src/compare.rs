//! Side-by-side comparison of SQL and DAX results.

use crate::execution::{QueryResult, Row};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write;

const MAX_COMPARED_ROWS: usize = 100;
const MAX_VALUE_DIFFERENCES: usize = 10;
const MAX_REPORTED_DIFFERENCES: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultComparison {
    pub matches: bool,
    pub row_count_match: bool,
    pub column_count_match: bool,
    pub data_match: bool,
    pub sql_rows: usize,
    pub dax_rows: usize,
    pub sql_columns: usize,
    pub dax_columns: usize,
    pub differences: Vec<String>,
    pub summary: String,
}

#[derive(Debug, PartialEq)]
enum Normalized {
    Null,
    Number(f64),
    Text(String),
}

fn normalize(value: Option<&Value>) -> Normalized {
    let text = match value {
        None | Some(Value::Null) => return Normalized::Null,
        Some(Value::Number(n)) => return n.as_f64().map_or(Normalized::Null, Normalized::Number),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    };
    match text.parse::<f64>() {
        Ok(n) if n.is_finite() => Normalized::Number(n),
        _ => Normalized::Text(text.to_lowercase()),
    }
}

/// Bare, lower-cased column name: `'Table'[Column]` and `[Column]` both become `column`.
fn column_key(name: &str) -> String {
    let bare = match (name.rfind('['), name.ends_with(']')) {
        (Some(open), true) => &name[open + 1..name.len() - 1],
        _ => name,
    };
    bare.trim().to_lowercase()
}

fn display(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "None".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn columns_of(result: &QueryResult) -> Vec<String> {
    if result.columns.is_empty() {
        result.rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default()
    } else {
        result.columns.clone()
    }
}

/// Value differences over the first rows, on columns present on both sides.
fn compare_rows(sql_rows: &[Row], dax_rows: &[Row], sql_columns: &[String], dax_columns: &[String]) -> Vec<String> {
    let common: Vec<(&String, &String)> = sql_columns
        .iter()
        .filter_map(|s| {
            dax_columns
                .iter()
                .find(|d| column_key(d) == column_key(s))
                .map(|d| (s, d))
        })
        .collect();

    let mut differences = Vec::new();
    for (i, (sql_row, dax_row)) in sql_rows.iter().zip(dax_rows).take(MAX_COMPARED_ROWS).enumerate() {
        for (sql_col, dax_col) in &common {
            let sql_value = sql_row.get(*sql_col);
            let dax_value = dax_row.get(*dax_col);
            if normalize(sql_value) != normalize(dax_value) {
                differences.push(format!(
                    "Row {}, Column '{}': SQL='{}', DAX='{}'",
                    i + 1,
                    sql_col,
                    display(sql_value),
                    display(dax_value)
                ));
                if differences.len() >= MAX_VALUE_DIFFERENCES {
                    differences.push("... (more differences truncated)".to_string());
                    return differences;
                }
            }
        }
    }
    differences
}

pub fn compare_results(sql: &QueryResult, dax: &QueryResult) -> ResultComparison {
    let mut comparison = ResultComparison::default();

    if !sql.success || !dax.success {
        comparison.summary = "Cannot compare - one or both queries failed".to_string();
        if !sql.success {
            comparison.differences.push(format!(
                "SQL query failed: {}",
                sql.error.as_deref().unwrap_or("Unknown error")
            ));
        }
        if !dax.success {
            comparison.differences.push(format!(
                "DAX query failed: {}",
                dax.error.as_deref().unwrap_or("Unknown error")
            ));
        }
        return comparison;
    }

    comparison.sql_rows = sql.rows.len();
    comparison.dax_rows = dax.rows.len();
    comparison.row_count_match = comparison.sql_rows == comparison.dax_rows;
    if !comparison.row_count_match {
        comparison.differences.push(format!(
            "Row count differs: SQL={}, DAX={}",
            comparison.sql_rows, comparison.dax_rows
        ));
    }

    let sql_columns = columns_of(sql);
    let dax_columns = columns_of(dax);
    comparison.sql_columns = sql_columns.len();
    comparison.dax_columns = dax_columns.len();
    comparison.column_count_match = comparison.sql_columns == comparison.dax_columns;
    if !comparison.column_count_match {
        comparison.differences.push(format!(
            "Column count differs: SQL={}, DAX={}",
            comparison.sql_columns, comparison.dax_columns
        ));
    }

    match (sql.rows.is_empty(), dax.rows.is_empty()) {
        (true, true) => comparison.data_match = true,
        (false, false) => {
            let value_differences = compare_rows(&sql.rows, &dax.rows, &sql_columns, &dax_columns);
            comparison.data_match = value_differences.is_empty();
            comparison.differences.extend(value_differences);
        }
        _ => comparison
            .differences
            .push("One result set is empty while the other has data".to_string()),
    }

    comparison.matches = comparison.row_count_match && comparison.column_count_match && comparison.data_match;
    comparison.summary = if comparison.matches {
        format!(
            "Results match ({} rows, {} columns)",
            comparison.sql_rows, comparison.sql_columns
        )
    } else {
        format!("Results differ ({} differences found)", comparison.differences.len())
    };
    comparison
}

/// Plain-text report of a comparison, with execution times of both sides.
pub fn comparison_report(comparison: &ResultComparison, sql: &QueryResult, dax: &QueryResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "SQL vs DAX Results Comparison");
    let _ = writeln!(out, "{}", "=".repeat(50));
    let _ = writeln!(out, "Generated: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out);
    let _ = writeln!(out, "Summary: {}", comparison.summary);
    let _ = writeln!(out);
    let _ = writeln!(out, "Metrics:");
    let _ = writeln!(out, "  SQL rows: {}", comparison.sql_rows);
    let _ = writeln!(out, "  DAX rows: {}", comparison.dax_rows);
    let _ = writeln!(out, "  SQL columns: {}", comparison.sql_columns);
    let _ = writeln!(out, "  DAX columns: {}", comparison.dax_columns);
    let _ = writeln!(out);

    let sql_secs = sql.execution_time_ms as f64 / 1000.0;
    let dax_secs = dax.execution_time_ms as f64 / 1000.0;
    let _ = writeln!(out, "Performance:");
    let _ = writeln!(out, "  SQL execution: {:.3}s", sql_secs);
    let _ = writeln!(out, "  DAX execution: {:.3}s", dax_secs);
    if sql_secs > 0.0 && dax_secs > 0.0 {
        let faster = if sql_secs < dax_secs { "SQL" } else { "DAX" };
        let ratio = sql_secs.max(dax_secs) / sql_secs.min(dax_secs);
        let _ = writeln!(out, "  Faster: {} ({:.2}x)", faster, ratio);
    }
    let _ = writeln!(out);

    if comparison.differences.is_empty() {
        let _ = writeln!(out, "No differences found.");
    } else {
        let _ = writeln!(out, "Differences:");
        for (i, diff) in comparison.differences.iter().take(MAX_REPORTED_DIFFERENCES).enumerate() {
            let _ = writeln!(out, "  {}. {}", i + 1, diff);
        }
        if comparison.differences.len() > MAX_REPORTED_DIFFERENCES {
            let _ = writeln!(
                out,
                "  ... and {} more differences",
                comparison.differences.len() - MAX_REPORTED_DIFFERENCES
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(rows: Value) -> QueryResult {
        let rows = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().unwrap().clone())
            .collect();
        QueryResult::ok("test", Vec::new(), rows, 20)
    }

    #[test]
    fn test_matching_results() {
        let sql = result(json!([{"NAME": "Alice", "TOTAL": 100}, {"NAME": "Bob", "TOTAL": 200.5}]));
        let dax = result(json!([
            {"'DIM_CUSTOMER'[NAME]": " alice ", "[TOTAL]": "100"},
            {"'DIM_CUSTOMER'[NAME]": "BOB", "[TOTAL]": 200.5}
        ]));
        let comparison = compare_results(&sql, &dax);
        assert!(comparison.matches, "{:?}", comparison.differences);
        assert_eq!(comparison.summary, "Results match (2 rows, 2 columns)");
    }

    #[test]
    fn test_value_and_count_differences() {
        let sql = result(json!([{"A": 1}, {"A": 2}]));
        let dax = result(json!([{"A": 1}, {"A": 3}, {"A": 4}]));
        let comparison = compare_results(&sql, &dax);
        assert!(!comparison.matches);
        assert!(!comparison.row_count_match);
        assert!(comparison.column_count_match);
        assert_eq!(
            comparison.differences,
            vec!["Row count differs: SQL=2, DAX=3", "Row 2, Column 'A': SQL='2', DAX='3'"]
        );
        assert_eq!(comparison.summary, "Results differ (2 differences found)");
    }

    #[test]
    fn test_difference_truncation() {
        let rows: Vec<Value> = (0..20).map(|i| json!({"A": i})).collect();
        let other: Vec<Value> = (0..20).map(|i| json!({"A": i + 1})).collect();
        let comparison = compare_results(&result(json!(rows)), &result(json!(other)));
        assert_eq!(comparison.differences.len(), 11);
        assert_eq!(comparison.differences[10], "... (more differences truncated)");
    }

    #[test]
    fn test_failed_and_empty_sides() {
        let failed = QueryResult::failed("x", "timeout", 5);
        let comparison = compare_results(&failed, &result(json!([])));
        assert_eq!(comparison.summary, "Cannot compare - one or both queries failed");
        assert_eq!(comparison.differences, vec!["SQL query failed: timeout"]);

        let both_empty = compare_results(&result(json!([])), &result(json!([])));
        assert!(both_empty.matches);

        let one_empty = compare_results(&result(json!([{"A": null}])), &result(json!([])));
        assert!(!one_empty.data_match);
        assert!(one_empty
            .differences
            .contains(&"One result set is empty while the other has data".to_string()));
    }

    #[test]
    fn test_report() {
        let sql = result(json!([{"A": 1}]));
        let dax = result(json!([{"A": 2}]));
        let comparison = compare_results(&sql, &dax);
        let report = comparison_report(&comparison, &sql, &dax);
        assert!(report.contains("Summary: Results differ (1 differences found)"));
        assert!(report.contains("  1. Row 1, Column 'A': SQL='1', DAX='2'"));
        assert!(report.contains("SQL execution: 0.020s"));
    }
}
