//! DAX query validator.
//!
//! A rule set over query text checked against the discovered schema. Rules run
//! in a fixed order (syntax, tables, columns, functions, relationships,
//! aggregation patterns, best practices) and every finding is reported; a
//! query is valid when no rule produced an [`Severity::Error`].
//!
//! When a query is invalid the validator also attempts mechanical repairs
//! (missing `EVALUATE`, unquoted table references, table names that differ
//! only by case or separators) and returns the repaired text if anything
//! changed.

use crate::dax::{find_calls, line_of, mask_literals, split_args};
use crate::schema::{DatabaseSchema, TableInfo, TableKind};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref QUOTED_TABLE: Regex = Regex::new(r"'([^']+)'").unwrap();
    static ref COLUMN_REF: Regex = Regex::new(r"'([^']+)'\[([^\]]+)\]").unwrap();
    static ref UNQUOTED_REF: Regex = Regex::new(r"(^|[^'\w\]])([A-Za-z_][A-Za-z0-9_]*)\[").unwrap();
    static ref DEFINED_MEASURE: Regex = Regex::new(r"(?i)\bMEASURE\s+'([^']+)'\[([^\]]+)\]").unwrap();
    static ref ORDER_BY: Regex = Regex::new(r"(?i)\bORDER\s+BY\b").unwrap();
    static ref LIMIT: Regex = Regex::new(r"(?i)\bLIMIT\b").unwrap();
    static ref RELATED_REF: Regex = Regex::new(r"(?i)\bRELATED\s*\(\s*'([^']+)'\[").unwrap();
    static ref RELATED_CALL: Regex = Regex::new(r"(?i)\bRELATED\s*\(").unwrap();
    static ref ROW_CONTEXT: Regex =
        Regex::new(r"(?i)\b(SUMMARIZE|ADDCOLUMNS|SELECTCOLUMNS|FILTER|GENERATE|SUMX|AVERAGEX|COUNTX|MINX|MAXX)\s*\(").unwrap();
    static ref SUMMARIZE_FROM: Regex = Regex::new(r"(?i)\b(?:SUMMARIZE|ADDCOLUMNS)\s*\(\s*'([^']+)'").unwrap();
    static ref CALCULATE_SUM: Regex = Regex::new(r"(?i)\bCALCULATE\s*\(\s*SUM\s*\(\s*'([^']+)'").unwrap();
    static ref CALCULATE: Regex = Regex::new(r"(?i)\bCALCULATE\s*\(").unwrap();
    static ref VALUES_CALL: Regex = Regex::new(r"(?i)\bVALUES\s*\(").unwrap();
    static ref ADDCOLUMNS_CALL: Regex = Regex::new(r"(?i)\bADDCOLUMNS\s*\(").unwrap();
    static ref NUMBER: Regex = Regex::new(r"^\d+$").unwrap();
}

const MAX_QUERY_LENGTH: usize = 2000;
const SIMILARITY_THRESHOLD: f64 = 0.85;

/// DAX functions and keywords that may legitimately precede `[` without quotes.
const NON_TABLE_WORDS: &[&str] = &["VAR", "RETURN", "IN", "AND", "OR", "NOT", "EVALUATE", "DEFINE", "MEASURE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
    pub line: Option<usize>,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            line: None,
            suggestion: None,
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub(crate) fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub(crate) fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub(crate) fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub(crate) fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub corrected_query: Option<String>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Closest candidate by separator-insensitive equality, then Jaro-Winkler similarity.
fn closest<'a, I>(wanted: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    let key = normalize_name(wanted);
    if let Some(exact) = candidates.clone().into_iter().find(|c| normalize_name(c) == key) {
        return Some(exact);
    }
    candidates
        .into_iter()
        .map(|c| (c, strsim::jaro_winkler(&key, &normalize_name(c))))
        .filter(|(_, score)| *score >= SIMILARITY_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c)
}

pub struct DaxValidator<'a> {
    schema: &'a DatabaseSchema,
}

impl<'a> DaxValidator<'a> {
    pub fn new(schema: &'a DatabaseSchema) -> Self {
        Self { schema }
    }

    fn table_names(&self) -> impl Iterator<Item = &'a str> + Clone {
        self.schema.tables.iter().map(|t| t.name.as_str())
    }

    fn kind_of(&self, name: &str) -> TableKind {
        match self.schema.table(name) {
            Some(table) if table.kind != TableKind::Unknown => table.kind,
            _ => {
                let upper = name.to_uppercase();
                if upper.contains("FACT") {
                    TableKind::Fact
                } else if upper.contains("DIM") {
                    TableKind::Dimension
                } else {
                    TableKind::Unknown
                }
            }
        }
    }

    pub fn validate(&self, query: &str) -> ValidationResult {
        let masked = mask_literals(query);
        let normalized = WHITESPACE.replace_all(masked.trim(), " ").to_string();
        let mut issues = Vec::new();

        self.check_syntax(&normalized, &masked, &mut issues);
        self.check_tables(&normalized, &mut issues);
        self.check_columns(&normalized, &mut issues);
        self.check_functions(&normalized, &masked, &mut issues);
        self.check_relationships(&normalized, &mut issues);
        self.check_customer_aggregation(&normalized, &mut issues);
        self.check_best_practices(&normalized, &mut issues);

        let is_valid = !issues.iter().any(|i| i.severity == Severity::Error);
        let corrected_query = if is_valid {
            None
        } else {
            self.correct(query).filter(|fixed| fixed != query)
        };

        ValidationResult {
            is_valid,
            issues,
            corrected_query,
        }
    }

    fn unquoted_tables<'q>(&self, text: &'q str) -> Vec<&'q str> {
        UNQUOTED_REF
            .captures_iter(text)
            .filter_map(|c| c.get(2))
            .map(|m| m.as_str())
            .filter(|w| !NON_TABLE_WORDS.iter().any(|k| k.eq_ignore_ascii_case(w)))
            .unique()
            .collect()
    }

    fn check_syntax(&self, normalized: &str, masked: &str, issues: &mut Vec<ValidationIssue>) {
        let upper = normalized.to_uppercase();
        if !(upper.starts_with("EVALUATE") || upper.starts_with("DEFINE")) {
            issues.push(
                ValidationIssue::error("DAX query must start with EVALUATE")
                    .at_line(1)
                    .suggest("Prefix the table expression with EVALUATE"),
            );
        }

        let open = masked.matches('(').count();
        let close = masked.matches(')').count();
        if open != close {
            issues.push(ValidationIssue::error(format!(
                "Unbalanced parentheses: {} opening, {} closing",
                open, close
            )));
        }

        // Brackets inside quoted table names are legal; count outside them only.
        let outside_names = QUOTED_TABLE.replace_all(masked, "''");
        let open = outside_names.matches('[').count();
        let close = outside_names.matches(']').count();
        if open != close {
            issues.push(ValidationIssue::error(format!(
                "Unbalanced brackets: {} opening, {} closing",
                open, close
            )));
        }

        for table in self.unquoted_tables(normalized) {
            issues.push(
                ValidationIssue::error(format!("Unquoted table reference: {}[...]", table))
                    .suggest(format!("Use single quotes around table names: '{}'[...]", table)),
            );
        }
    }

    fn check_tables(&self, normalized: &str, issues: &mut Vec<ValidationIssue>) {
        let referenced: Vec<&str> = QUOTED_TABLE
            .captures_iter(normalized)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .unique()
            .collect();

        for name in referenced {
            if self.schema.table(name).is_some() {
                continue;
            }
            let suggestion = match closest(name, self.table_names()) {
                Some(candidate) => format!("Did you mean '{}'?", candidate),
                None => format!("Available tables: {}", self.table_names().take(10).join(", ")),
            };
            issues.push(ValidationIssue::error(format!("Table '{}' not found in schema", name)).suggest(suggestion));
        }
    }

    fn defined_measures(&self, normalized: &str) -> HashSet<(String, String)> {
        DEFINED_MEASURE
            .captures_iter(normalized)
            .map(|c| (c[1].to_uppercase(), c[2].to_uppercase()))
            .collect()
    }

    fn check_columns(&self, normalized: &str, issues: &mut Vec<ValidationIssue>) {
        let measures = self.defined_measures(normalized);
        let mut seen = HashSet::new();

        for caps in COLUMN_REF.captures_iter(normalized) {
            let (table_name, column) = (&caps[1], &caps[2]);
            if !seen.insert((table_name.to_uppercase(), column.to_uppercase())) {
                continue;
            }
            let Some(table) = self.schema.table(table_name) else {
                continue;
            };
            if table.column(column).is_some()
                || measures.contains(&(table_name.to_uppercase(), column.to_uppercase()))
            {
                continue;
            }
            issues.push(
                ValidationIssue::error(format!("Column '{}' not found in table '{}'", column, table.name))
                    .suggest(column_suggestion(table, column)),
            );
        }
    }

    fn check_functions(&self, normalized: &str, masked: &str, issues: &mut Vec<ValidationIssue>) {
        if ORDER_BY.is_match(normalized) {
            let line = ORDER_BY.find(masked).map(|m| line_of(masked, m.start())).unwrap_or(1);
            issues.push(
                ValidationIssue::error("ORDER BY is not supported in generated DAX queries")
                    .at_line(line)
                    .suggest("Use TOPN(n, <table>, <expression>, DESC) to rank rows"),
            );
        }

        if LIMIT.is_match(normalized) {
            let line = LIMIT.find(masked).map(|m| line_of(masked, m.start())).unwrap_or(1);
            issues.push(
                ValidationIssue::error("LIMIT is SQL syntax and does not exist in DAX")
                    .at_line(line)
                    .suggest("Use TOPN(n, <table>, <expression>, DESC) to restrict rows"),
            );
        }

        for args in find_calls(normalized, "SUMMARIZECOLUMNS") {
            let tables: Vec<String> = COLUMN_REF
                .captures_iter(args)
                .map(|c| c[1].to_string())
                .unique_by(|t| t.to_uppercase())
                .collect();
            if tables.len() > 1 {
                issues.push(
                    ValidationIssue::warning(format!(
                        "SUMMARIZECOLUMNS spans multiple tables ({}); this can produce cartesian products",
                        tables.join(", ")
                    ))
                    .suggest("Start from the fact table with SUMMARIZE or ADDCOLUMNS and use RELATED() for dimension attributes"),
                );
            }
        }
    }

    fn check_relationships(&self, normalized: &str, issues: &mut Vec<ValidationIssue>) {
        let related: Vec<&str> = RELATED_REF
            .captures_iter(normalized)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .unique()
            .collect();

        for name in related {
            match self.schema.table(name) {
                None => issues.push(ValidationIssue::error(format!(
                    "RELATED references unknown table '{}'",
                    name
                ))),
                Some(table) => {
                    if !self.schema.relationships.is_empty()
                        && self.schema.relationships_for(&table.name).next().is_none()
                    {
                        issues.push(
                            ValidationIssue::warning(format!(
                                "Table '{}' has no relationships; RELATED('{}'[...]) will fail",
                                table.name, table.name
                            ))
                            .suggest("Reference a table related to the iterated table"),
                        );
                    }
                }
            }
        }

        if RELATED_CALL.is_match(normalized) && !ROW_CONTEXT.is_match(normalized) {
            issues.push(
                ValidationIssue::warning("RELATED is used without a row context")
                    .suggest("Use RELATED inside ADDCOLUMNS, SUMMARIZE or an iterator over the fact table"),
            );
        }
    }

    fn check_customer_aggregation(&self, normalized: &str, issues: &mut Vec<ValidationIssue>) {
        let upper = normalized.to_uppercase();
        let from_dimension: Vec<&str> = SUMMARIZE_FROM
            .captures_iter(normalized)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|t| self.kind_of(t) == TableKind::Dimension)
            .collect();
        let fact_sums: Vec<&str> = CALCULATE_SUM
            .captures_iter(normalized)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|t| self.kind_of(t) == TableKind::Fact)
            .collect();

        if let (Some(dim), Some(fact)) = (from_dimension.first(), fact_sums.first()) {
            issues.push(
                ValidationIssue::error(format!(
                    "Aggregation starts from dimension table '{}' and sums fact table '{}' with CALCULATE",
                    dim, fact
                ))
                .suggest(format!(
                    "Start from the fact table: ADDCOLUMNS(SUMMARIZE('{}', <key>), \"Name\", RELATED('{}'[<name>]), \"Total\", SUM(...))",
                    fact, dim
                )),
            );
        } else if let Some(dim) = from_dimension.first() {
            if upper.contains("CUSTOMER") {
                issues.push(
                    ValidationIssue::warning(format!(
                        "SUMMARIZE over dimension table '{}' for customer totals may miss fact context",
                        dim
                    ))
                    .suggest("Summarize the fact table by customer key and fetch names with RELATED()"),
                );
            }
        }

        if VALUES_CALL.is_match(normalized) && upper.contains("CUSTOMER") && ADDCOLUMNS_CALL.is_match(normalized) {
            issues.push(
                ValidationIssue::warning("ADDCOLUMNS over VALUES() of customers evaluates totals per customer without fact grouping")
                    .suggest("Start from SUMMARIZE over the fact table grouped by the customer key"),
            );
        }
    }

    fn check_best_practices(&self, normalized: &str, issues: &mut Vec<ValidationIssue>) {
        if normalized.len() > MAX_QUERY_LENGTH {
            issues.push(
                ValidationIssue::info(format!("Query is long ({} characters)", normalized.len()))
                    .suggest("Break it up with VAR definitions"),
            );
        }

        let calculate_count = CALCULATE.find_iter(normalized).count();
        if calculate_count > 1 {
            issues.push(
                ValidationIssue::info(format!("Query uses CALCULATE {} times", calculate_count))
                    .suggest("Consider VAR definitions to avoid repeated context transitions"),
            );
        }

        for args in find_calls(normalized, "TOPN") {
            let parts = split_args(args);
            let has_order = parts
                .iter()
                .skip(2)
                .any(|p| p.eq_ignore_ascii_case("DESC") || p.eq_ignore_ascii_case("ASC"));
            if !has_order {
                issues.push(
                    ValidationIssue::warning("TOPN without explicit ASC/DESC ordering")
                        .suggest("Add DESC (or ASC) after the ordering expression"),
                );
            }
            if !parts.first().map_or(false, |n| NUMBER.is_match(n)) {
                issues.push(
                    ValidationIssue::warning("TOPN should take a literal row count as its first argument")
                        .suggest("Use TOPN(10, ...) with an explicit number"),
                );
            }
        }
    }

    /// Mechanical repairs applied to the original text.
    pub fn correct(&self, query: &str) -> Option<String> {
        let masked = mask_literals(query);
        let mut fixed = query.to_string();

        // Quote unquoted table references, right to left so offsets stay valid.
        let mut spans: Vec<(usize, usize, String)> = UNQUOTED_REF
            .captures_iter(&masked)
            .filter_map(|c| c.get(2))
            .filter(|m| !NON_TABLE_WORDS.iter().any(|k| k.eq_ignore_ascii_case(m.as_str())))
            .map(|m| {
                let name = self
                    .schema
                    .table(m.as_str())
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| m.as_str().to_string());
                (m.start(), m.end(), format!("'{}'", name))
            })
            .collect();

        // Table names that differ from a schema table only by case or separators.
        for caps in QUOTED_TABLE.captures_iter(&masked) {
            if let Some(m) = caps.get(1) {
                if self.schema.table(m.as_str()).is_none() {
                    let key = normalize_name(m.as_str());
                    if let Some(t) = self.schema.tables.iter().find(|t| normalize_name(&t.name) == key) {
                        spans.push((m.start(), m.end(), t.name.clone()));
                    }
                }
            }
        }

        spans.sort_by(|a, b| b.0.cmp(&a.0));
        for (start, end, replacement) in spans {
            fixed.replace_range(start..end, &replacement);
        }

        let upper = fixed.trim_start().to_uppercase();
        if !(upper.starts_with("EVALUATE") || upper.starts_with("DEFINE")) {
            fixed = format!("EVALUATE\n{}", fixed.trim());
        }
        Some(fixed)
    }

    /// Up to 10 tables with up to 5 columns each, for prompts and error output.
    pub fn schema_summary(&self) -> String {
        let mut lines = vec!["Available tables:".to_string()];
        for table in self.schema.tables.iter().take(10) {
            let mut cols = table.columns.iter().take(5).map(|c| c.name.as_str()).join(", ");
            if table.columns.len() > 5 {
                cols.push_str(&format!(" (+{} more)", table.columns.len() - 5));
            }
            lines.push(format!("- '{}' ({}): {}", table.name, table.kind, cols));
        }
        if self.schema.tables.len() > 10 {
            lines.push(format!("... and {} more tables", self.schema.tables.len() - 10));
        }
        lines.join("\n")
    }
}

fn column_suggestion(table: &TableInfo, column: &str) -> String {
    let names = table.columns.iter().map(|c| c.name.as_str());
    match closest(column, names.clone()) {
        Some(candidate) => format!("Did you mean '{}'[{}]?", table.name, candidate),
        None => format!("Available columns: {}", names.take(5).join(", ")),
    }
}
