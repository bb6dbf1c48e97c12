//! SQL Checks
//!
//! Lightweight checks on generated T-SQL before it reaches the database.
//! Generated SQL only ever runs read-only.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;

lazy_static! {
    static ref STATEMENT_KEYWORD: Regex = Regex::new(r"(?i)\b(SELECT|INSERT|UPDATE|DELETE)\b").unwrap();
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"(?i)\bLIMIT\s+\d+").unwrap();
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SqlValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn validate_sql(sql: &str) -> SqlValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let trimmed = sql.trim();

    if trimmed.is_empty() {
        errors.push("SQL query is empty".to_string());
        return SqlValidation {
            is_valid: false,
            errors,
            warnings,
        };
    }

    if !STATEMENT_KEYWORD.is_match(trimmed) {
        errors.push("SQL query must contain SELECT, INSERT, UPDATE or DELETE".to_string());
    }

    let open = trimmed.matches('(').count();
    let close = trimmed.matches(')').count();
    if open != close {
        warnings.push(format!("Unbalanced parentheses: {} opening, {} closing", open, close));
    }

    if LIMIT_CLAUSE.is_match(trimmed) {
        warnings.push("LIMIT is not supported by Azure SQL; use TOP n instead".to_string());
    }

    match Parser::parse_sql(&MsSqlDialect {}, trimmed) {
        Ok(statements) => {
            if statements.is_empty() {
                errors.push("No SQL statement found".to_string());
            }
            if statements.len() > 1 {
                warnings.push(format!("{} statements found; only one is expected", statements.len()));
            }
            for statement in &statements {
                if let Some(reason) = write_reason(statement) {
                    errors.push(reason);
                }
            }
        }
        // The dialect does not cover all of T-SQL, so a parse failure is only advisory.
        Err(e) => warnings.push(format!("SQL parser could not verify the query: {}", e)),
    }

    SqlValidation {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn write_reason(statement: &Statement) -> Option<String> {
    match statement {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) if select.into.is_some() => {
                Some("SELECT ... INTO creates a table; only read-only queries are allowed".to_string())
            }
            SetExpr::Insert(_) | SetExpr::Update(_) => {
                Some("Data modification is not allowed; only read-only queries are allowed".to_string())
            }
            _ => None,
        },
        other => {
            let text = other.to_string();
            let verb = text.split_whitespace().next().unwrap_or("statement").to_uppercase();
            Some(format!("{} statements are not allowed; only read-only queries are allowed", verb))
        }
    }
}
