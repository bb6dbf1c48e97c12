//! Deterministic DAX planning from question patterns.
//!
//! A question is classified (ranking, aggregation, filtering, ...), its words
//! are matched against table and column names, and one of five query
//! templates is filled in. No model is involved, so the same question over the
//! same schema always yields the same plan. The generator falls back to these
//! plans when model output stays invalid after repair.

use crate::dax::corrector::{name_column, preferred_measure};
use crate::dax::{mask_literals, Severity, ValidationIssue, ValidationResult};
use crate::error::{PipelineError, Result};
use crate::intent::Intent;
use crate::schema::{ColumnInfo, DatabaseSchema, Relationship, TableInfo, TableKind};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

lazy_static! {
    static ref RANKING: Regex =
        Regex::new(r"\b(top|bottom|best|worst)\s+\d+|\b(highest|lowest|largest|smallest)\b").unwrap();
    static ref CALCULATION: Regex = Regex::new(r"\b(percent|percentage|share|ratio|proportion)\b|% of").unwrap();
    static ref AGGREGATION: Regex = Regex::new(
        r"\b(total|sum|average|avg|mean|count|how many|number of|maximum|max|minimum|min|aggregate)\b"
    )
    .unwrap();
    static ref TREND: Regex = Regex::new(
        r"\b(trend|trends|over time|timeline|progression|monthly|quarterly|yearly)\b|\bby (month|year|quarter)\b"
    )
    .unwrap();
    static ref FILTERING: Regex = Regex::new(r"\b(show|list|get|find|display)\b").unwrap();
    static ref COMPARISON: Regex = Regex::new(r"\b(compare|versus|vs|difference|between)\b").unwrap();
    static ref AVERAGE: Regex = Regex::new(r"\b(average|avg|mean)\b").unwrap();
    static ref COUNT: Regex = Regex::new(r"\b(count|how many|number of)\b").unwrap();
    static ref MAXIMUM: Regex = Regex::new(r"\b(maximum|max)\b").unwrap();
    static ref MINIMUM: Regex = Regex::new(r"\b(minimum|min)\b").unwrap();
    static ref LIMIT_BEFORE: Regex = Regex::new(r"\b(?:top|first|bottom|last|best|worst)\s+(\d+)\b").unwrap();
    static ref LIMIT_AFTER: Regex = Regex::new(r"\b(\d+)\s+(?:highest|lowest|best|worst|largest|smallest)\b").unwrap();
    static ref EXPLICIT_ORDER: Regex =
        Regex::new(r"\b(?:order|sort)(?:ed)?\s+by\s+\w+(?:\s+(asc|ascending|desc|descending))?").unwrap();
    static ref ASCENDING: Regex = Regex::new(r"\b(bottom|lowest|smallest|worst|least)\b").unwrap();
    static ref TIME_CONTEXT: Regex = Regex::new(
        r"\b(this year|current year|last year|this month|current month|last month|by month|by year|by quarter|monthly|quarterly|yearly|20\d{2})\b"
    )
    .unwrap();
    static ref YEAR_LITERAL: Regex = Regex::new(r"\b(20\d{2})\b").unwrap();
    static ref QUOTED_VALUE: Regex = Regex::new(r#""([^"]+)"|(?:^|\s)'([^']+)'"#).unwrap();
    static ref THRESHOLD: Regex = Regex::new(
        r"(greater than|more than|over|above|at least|less than|under|below|at most|>=|<=|>|<)\s*\$?(\d+(?:\.\d+)?)"
    )
    .unwrap();
    static ref WORD: Regex = Regex::new(r"[a-z0-9]+").unwrap();
    static ref TABLE_REF: Regex = Regex::new(r"'([^']+)'").unwrap();
    static ref COLUMN_REF: Regex = Regex::new(r"'([^']+)'\[([^\]]+)\]").unwrap();
    static ref BARE_REF: Regex = Regex::new(r"(?:^|[^'\]\w])\[([^\]]+)\]").unwrap();
    static ref LABEL: Regex = Regex::new(r#""([^"]+)""#).unwrap();
}

const DEFAULT_TOP: u32 = 10;
const TABLE_PREFIXES: &[&str] = &["fact", "dim", "dimension", "tbl", "lkp", "dbo"];
const GENERIC_WORDS: &[&str] = &[
    "amount", "name", "value", "date", "total", "count", "number", "usd", "type", "flag", "desc",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Filtering,
    Aggregation,
    Ranking,
    Comparison,
    Trend,
    Calculation,
    Unknown,
}

impl QueryKind {
    fn detect(text: &str) -> Self {
        if RANKING.is_match(text) {
            QueryKind::Ranking
        } else if CALCULATION.is_match(text) {
            QueryKind::Calculation
        } else if AGGREGATION.is_match(text) {
            QueryKind::Aggregation
        } else if TREND.is_match(text) {
            QueryKind::Trend
        } else if FILTERING.is_match(text) {
            QueryKind::Filtering
        } else if COMPARISON.is_match(text) {
            QueryKind::Comparison
        } else {
            QueryKind::Unknown
        }
    }

    fn aggregates(&self) -> bool {
        matches!(
            self,
            QueryKind::Ranking | QueryKind::Aggregation | QueryKind::Calculation | QueryKind::Trend
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaxPattern {
    SimpleFilter,
    MeasureAggregation,
    TopN,
    CalculateFilter,
    TimeIntelligence,
}

impl DaxPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaxPattern::SimpleFilter => "SIMPLE_FILTER",
            DaxPattern::MeasureAggregation => "MEASURE_AGGREGATION",
            DaxPattern::TopN => "TOP_N",
            DaxPattern::CalculateFilter => "CALCULATE_FILTER",
            DaxPattern::TimeIntelligence => "TIME_INTELLIGENCE",
        }
    }
}

impl fmt::Display for DaxPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Average,
    Count,
    Max,
    Min,
}

impl Aggregation {
    fn detect(text: &str) -> Option<Self> {
        if AVERAGE.is_match(text) {
            Some(Aggregation::Average)
        } else if COUNT.is_match(text) {
            Some(Aggregation::Count)
        } else if MAXIMUM.is_match(text) {
            Some(Aggregation::Max)
        } else if MINIMUM.is_match(text) {
            Some(Aggregation::Min)
        } else if AGGREGATION.is_match(text) {
            Some(Aggregation::Sum)
        } else {
            None
        }
    }

    fn function(&self) -> &'static str {
        match self {
            Aggregation::Sum => "SUM",
            Aggregation::Average => "AVERAGE",
            Aggregation::Count => "COUNTROWS",
            Aggregation::Max => "MAX",
            Aggregation::Min => "MIN",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Aggregation::Sum => "Total",
            Aggregation::Average => "Average",
            Aggregation::Count => "Count",
            Aggregation::Max => "Max",
            Aggregation::Min => "Min",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortDirection {
    #[serde(rename = "ASC")]
    Ascending,
    #[serde(rename = "DESC")]
    Descending,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Year,
    Quarter,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    CurrentYear,
    PreviousYear,
    Year(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    fn new(table: &TableInfo, column: &ColumnInfo) -> Self {
        Self {
            table: table.name.clone(),
            column: column.name.clone(),
        }
    }

    pub fn dax(&self) -> String {
        format!("'{}'[{}]", self.table, self.column)
    }

    /// Reference as seen from a row of `primary`; other tables go through RELATED.
    fn from_row_of(&self, primary: &TableInfo) -> String {
        if self.table.eq_ignore_ascii_case(&primary.name) {
            self.dax()
        } else {
            format!("RELATED({})", self.dax())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterCondition {
    pub column: ColumnRef,
    pub operator: String,
    /// DAX literal: quoted text or a bare number.
    pub value: String,
}

/// What the question asks for, before any template is chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnalysis {
    pub question: String,
    pub kind: QueryKind,
    pub tables: Vec<String>,
    pub columns: Vec<ColumnRef>,
    pub measures: Vec<ColumnRef>,
    /// Quoted literals from the question, matched to columns while planning.
    pub values: Vec<String>,
    /// Numeric comparisons as `(operator, number)`.
    pub thresholds: Vec<(String, String)>,
    pub aggregation: Option<Aggregation>,
    pub direction: SortDirection,
    pub limit: Option<u32>,
    pub time_context: Option<String>,
    pub grain: TimeGrain,
    pub period: Option<Period>,
}

impl QueryAnalysis {
    fn has_entities(&self) -> bool {
        !self.tables.is_empty() || !self.columns.is_empty() || !self.measures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DaxQueryPlan {
    pub analysis: QueryAnalysis,
    pub pattern: DaxPattern,
    pub primary_table: String,
    /// Tables the expression references.
    pub tables: Vec<String>,
    /// Grouping columns.
    pub columns: Vec<ColumnRef>,
    /// Aggregate expressions, one per value column.
    pub measures: Vec<String>,
    pub filters: Vec<FilterCondition>,
    pub relationships: Vec<Relationship>,
    pub expression: String,
    pub confidence: f64,
}

struct ValueExpr {
    label: String,
    expr: String,
}

fn question_words(text: &str) -> HashSet<String> {
    let mut words = HashSet::new();
    for word in WORD.find_iter(text).map(|m| m.as_str()) {
        if word.len() > 3 {
            if let Some(singular) = word.strip_suffix('s') {
                words.insert(singular.to_string());
            }
        }
        words.insert(word.to_string());
    }
    words
}

fn name_words(name: &str, skip: &[&str]) -> Vec<String> {
    name.split(|c: char| c == '_' || c == '.' || c.is_whitespace())
        .map(str::to_lowercase)
        .filter(|w| w.len() >= 3 && !skip.contains(&w.as_str()))
        .collect()
}

fn title(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let lower = w.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .join(" ")
}

fn is_text(column: &ColumnInfo) -> bool {
    !column.is_numeric() && !column.is_temporal() && !column.is_key()
}

fn dax_text(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn comparison_operator(phrase: &str) -> &'static str {
    match phrase {
        "at least" | ">=" => ">=",
        "at most" | "<=" => "<=",
        "less than" | "under" | "below" | "<" => "<",
        _ => ">",
    }
}

pub struct PatternPlanner<'a> {
    schema: &'a DatabaseSchema,
}

impl<'a> PatternPlanner<'a> {
    pub fn new(schema: &'a DatabaseSchema) -> Self {
        Self { schema }
    }

    pub fn analyze(&self, question: &str, intent: Option<&Intent>) -> QueryAnalysis {
        let values: Vec<String> = QUOTED_VALUE
            .captures_iter(question)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        let text = QUOTED_VALUE.replace_all(question, " ").to_lowercase();

        let mut kind = QueryKind::detect(&text);
        if kind == QueryKind::Unknown {
            if let Some(intent) = intent {
                kind = QueryKind::detect(&intent.intent.to_lowercase());
            }
        }

        let (tables, mut columns, mut measures) = self.mentions(&question_words(&text));
        if let Some(intent) = intent {
            for name in intent.group_by.iter().chain(&intent.measures) {
                if let Some((table, column)) = self.resolve_column(name) {
                    let target = if column.is_measure() { &mut measures } else { &mut columns };
                    let reference = ColumnRef::new(table, column);
                    if !column.is_key() && !target.contains(&reference) {
                        target.push(reference);
                    }
                }
            }
        }

        let thresholds = THRESHOLD
            .captures_iter(&text)
            .map(|c| (comparison_operator(&c[1]).to_string(), c[2].to_string()))
            .collect();

        let limit = LIMIT_BEFORE
            .captures(&text)
            .or_else(|| LIMIT_AFTER.captures(&text))
            .and_then(|c| c[1].parse().ok())
            .or_else(|| intent.and_then(|i| i.limit));

        let direction = match EXPLICIT_ORDER.captures(&text) {
            Some(caps) => match caps.get(1).map(|m| m.as_str()) {
                Some("desc") | Some("descending") => SortDirection::Descending,
                _ => SortDirection::Ascending,
            },
            None if ASCENDING.is_match(&text) => SortDirection::Ascending,
            None => SortDirection::Descending,
        };

        let matched: Vec<&str> = TIME_CONTEXT.find_iter(&text).map(|m| m.as_str()).unique().collect();
        let time_context = if matched.is_empty() {
            intent.and_then(|i| i.time_context.clone())
        } else {
            Some(matched.join(", "))
        };
        let time_text = time_context.as_deref().unwrap_or("").to_lowercase();

        let grain = if time_text.contains("month") || text.contains("monthly") {
            TimeGrain::Month
        } else if time_text.contains("quarter") || text.contains("quarterly") {
            TimeGrain::Quarter
        } else {
            TimeGrain::Year
        };

        let period = if time_text.contains("this year") || time_text.contains("current year") {
            Some(Period::CurrentYear)
        } else if time_text.contains("last year") {
            Some(Period::PreviousYear)
        } else {
            YEAR_LITERAL
                .captures(&time_text)
                .and_then(|c| c[1].parse().ok())
                .map(Period::Year)
        };

        QueryAnalysis {
            question: question.to_string(),
            kind,
            tables,
            columns,
            measures,
            values,
            thresholds,
            aggregation: Aggregation::detect(&text),
            direction,
            limit,
            time_context,
            grain,
            period,
        }
    }

    /// Tables, plain columns and measure columns whose names share a word with the question.
    fn mentions(&self, words: &HashSet<String>) -> (Vec<String>, Vec<ColumnRef>, Vec<ColumnRef>) {
        let mut tables = Vec::new();
        let mut columns = Vec::new();
        let mut measures = Vec::new();

        for table in &self.schema.tables {
            let table_words = name_words(&table.name, TABLE_PREFIXES);
            if table_words.iter().any(|w| words.contains(w)) {
                tables.push(table.name.clone());
            }
            for column in table.columns.iter().filter(|c| !c.is_key()) {
                // Words repeating the table name say nothing about the column.
                let hit = name_words(&column.name, GENERIC_WORDS)
                    .into_iter()
                    .filter(|w| !table_words.contains(w))
                    .any(|w| words.contains(&w));
                if hit {
                    let reference = ColumnRef::new(table, column);
                    if column.is_measure() {
                        measures.push(reference);
                    } else {
                        columns.push(reference);
                    }
                }
            }
        }
        (tables, columns, measures)
    }

    fn resolve_column(&self, name: &str) -> Option<(&'a TableInfo, &'a ColumnInfo)> {
        let cleaned = name.replace(['\'', '[', ']', '"'], "");
        let (table, column) = match cleaned.rsplit_once('.') {
            Some((table, column)) => (Some(table.trim()), column.trim()),
            None => (None, cleaned.trim()),
        };
        self.schema
            .tables
            .iter()
            .filter(|t| table.map_or(true, |name| t.name.eq_ignore_ascii_case(name)))
            .find_map(|t| t.column(column).map(|c| (t, c)))
    }

    fn column_info(&self, reference: &ColumnRef) -> Option<&'a ColumnInfo> {
        self.schema.table(&reference.table)?.column(&reference.column)
    }

    /// `table` is the primary table or sits one many-to-one hop away from it.
    fn reachable(&self, primary: &TableInfo, table: &str) -> bool {
        table.eq_ignore_ascii_case(&primary.name)
            || self
                .schema
                .relationships
                .iter()
                .any(|r| r.from_table.eq_ignore_ascii_case(&primary.name) && r.to_table.eq_ignore_ascii_case(table))
    }

    /// First fact table with a measure that references `dimension`.
    fn fact_for(&self, dimension: &TableInfo) -> Option<&'a TableInfo> {
        self.schema
            .relationships
            .iter()
            .filter(|r| r.to_table.eq_ignore_ascii_case(&dimension.name))
            .filter_map(|r| self.schema.table(&r.from_table))
            .find(|t| t.kind == TableKind::Fact && preferred_measure(t).is_some())
    }

    fn primary_table(&self, analysis: &QueryAnalysis) -> Option<&'a TableInfo> {
        let mentioned = || analysis.tables.iter().filter_map(|name| self.schema.table(name));
        analysis
            .measures
            .first()
            .and_then(|m| self.schema.table(&m.table))
            .or_else(|| mentioned().find(|t| t.kind == TableKind::Fact))
            .or_else(|| {
                if analysis.kind.aggregates() {
                    mentioned().find_map(|t| self.fact_for(t))
                } else {
                    None
                }
            })
            .or_else(|| mentioned().next())
            .or_else(|| analysis.columns.first().and_then(|c| self.schema.table(&c.table)))
            .or_else(|| {
                self.schema
                    .tables_of_kind(TableKind::Fact)
                    .find(|t| t.measure_columns().next().is_some())
            })
            .or_else(|| self.schema.tables.first())
    }

    fn measure_for(&self, analysis: &QueryAnalysis, primary: &TableInfo) -> Option<ColumnRef> {
        analysis
            .measures
            .iter()
            .find(|m| m.table.eq_ignore_ascii_case(&primary.name))
            .cloned()
            .or_else(|| preferred_measure(primary).map(|c| ColumnRef::new(primary, c)))
    }

    /// Non-key date column of the primary table, else of a table it references.
    fn date_column(&self, primary: &TableInfo) -> Option<ColumnRef> {
        let dated = |table: &TableInfo| {
            table
                .columns
                .iter()
                .find(|c| c.is_temporal() && !c.is_key())
                .map(|c| ColumnRef::new(table, c))
        };
        dated(primary).or_else(|| {
            self.schema
                .tables
                .iter()
                .filter(|t| !t.name.eq_ignore_ascii_case(&primary.name) && self.reachable(primary, &t.name))
                .find_map(|t| dated(t))
        })
    }

    fn resolve_filters(
        &self,
        analysis: &QueryAnalysis,
        primary: &TableInfo,
        measure: Option<&ColumnRef>,
    ) -> Vec<FilterCondition> {
        let mut filters = Vec::new();

        for value in &analysis.values {
            let in_samples = self
                .schema
                .tables
                .iter()
                .filter(|t| self.reachable(primary, &t.name))
                .find_map(|t| {
                    t.columns
                        .iter()
                        .find(|c| {
                            t.sample_data.iter().any(|row| {
                                row.get(&c.name)
                                    .and_then(|v| v.as_str())
                                    .map_or(false, |s| s.eq_ignore_ascii_case(value))
                            })
                        })
                        .map(|c| ColumnRef::new(t, c))
                });
            let column = in_samples
                .or_else(|| {
                    analysis
                        .columns
                        .iter()
                        .filter(|c| self.reachable(primary, &c.table))
                        .find(|c| self.column_info(c).map_or(false, is_text))
                        .cloned()
                })
                .or_else(|| primary.columns.iter().find(|c| is_text(c)).map(|c| ColumnRef::new(primary, c)));

            match column {
                Some(column) => filters.push(FilterCondition {
                    column,
                    operator: "=".to_string(),
                    value: dax_text(value),
                }),
                None => debug!("No text column to filter on for value {:?}", value),
            }
        }

        if let Some(measure) = measure {
            for (operator, number) in &analysis.thresholds {
                filters.push(FilterCondition {
                    column: measure.clone(),
                    operator: operator.clone(),
                    value: number.clone(),
                });
            }
        }
        filters
    }

    fn group_columns(&self, analysis: &QueryAnalysis, primary: &TableInfo, filters: &[FilterCondition]) -> Vec<ColumnRef> {
        let mut groups: Vec<ColumnRef> = analysis
            .columns
            .iter()
            .filter(|c| self.reachable(primary, &c.table))
            .filter(|c| !filters.iter().any(|f| &f.column == *c))
            .filter(|c| self.column_info(c).map_or(false, |info| !info.is_temporal()))
            .cloned()
            .collect();

        // A mentioned dimension without a mentioned column groups by its name column.
        for table in analysis.tables.iter().filter_map(|name| self.schema.table(name)) {
            if table.name.eq_ignore_ascii_case(&primary.name)
                || !self.reachable(primary, &table.name)
                || groups.iter().any(|g| g.table.eq_ignore_ascii_case(&table.name))
            {
                continue;
            }
            if let Some(column) = name_column(table) {
                groups.push(ColumnRef::new(table, column));
            }
        }
        groups.into_iter().unique().collect()
    }

    pub fn select_pattern(&self, analysis: &QueryAnalysis) -> DaxPattern {
        match analysis.kind {
            QueryKind::Ranking if analysis.limit.is_some() => DaxPattern::TopN,
            QueryKind::Aggregation if analysis.time_context.is_some() => DaxPattern::TimeIntelligence,
            QueryKind::Aggregation => DaxPattern::MeasureAggregation,
            QueryKind::Trend => DaxPattern::TimeIntelligence,
            QueryKind::Filtering => DaxPattern::SimpleFilter,
            QueryKind::Calculation => DaxPattern::CalculateFilter,
            _ if analysis.aggregation.is_some() => DaxPattern::MeasureAggregation,
            _ => DaxPattern::SimpleFilter,
        }
    }

    fn confidence(analysis: &QueryAnalysis, pattern: DaxPattern) -> f64 {
        let mut tenths = 5u32;
        if analysis.has_entities() {
            tenths += 2;
        }
        if analysis.kind != QueryKind::Unknown {
            tenths += 2;
        }
        if pattern != DaxPattern::SimpleFilter {
            tenths += 1;
        }
        f64::from(tenths.min(10)) / 10.0
    }

    pub fn plan(&self, question: &str, intent: Option<&Intent>) -> Result<DaxQueryPlan> {
        if question.trim().is_empty() {
            return Err(PipelineError::Validation("Cannot plan DAX for an empty question".to_string()));
        }
        let analysis = self.analyze(question, intent);
        debug!("Question analysis: {:?}", analysis);
        let primary = self
            .primary_table(&analysis)
            .ok_or_else(|| PipelineError::Validation("Cannot plan DAX without schema tables".to_string()))?;

        let measure = self.measure_for(&analysis, primary);
        let filters = self.resolve_filters(&analysis, primary, measure.as_ref());
        let groups = self.group_columns(&analysis, primary, &filters);
        let date = self.date_column(primary).map(|d| d.from_row_of(primary));

        let mut conditions: Vec<String> = filters
            .iter()
            .map(|f| format!("{} {} {}", f.column.from_row_of(primary), f.operator, f.value))
            .collect();
        if let (Some(date), Some(period)) = (&date, analysis.period) {
            conditions.push(match period {
                Period::CurrentYear => format!("YEAR({}) = YEAR(TODAY())", date),
                Period::PreviousYear => format!("YEAR({}) = YEAR(TODAY()) - 1", date),
                Period::Year(year) => format!("YEAR({}) = {}", date, year),
            });
        }
        let table = format!("'{}'", primary.name);
        let source = if conditions.is_empty() {
            table.clone()
        } else {
            format!("FILTER({}, {})", table, conditions.join(" && "))
        };

        let aggregation = analysis.aggregation.unwrap_or(Aggregation::Sum);
        let value = match (&measure, aggregation) {
            (Some(m), agg) if agg != Aggregation::Count => ValueExpr {
                label: format!("{} {}", agg.label(), title(&m.column)),
                expr: format!("{}({})", agg.function(), m.dax()),
            },
            _ => ValueExpr {
                label: "Row Count".to_string(),
                expr: format!("COUNTROWS({})", table),
            },
        };

        let mut pattern = self.select_pattern(&analysis);
        if pattern == DaxPattern::TimeIntelligence && date.is_none() {
            debug!("No date column reachable from {}; aggregating without time grain", primary.name);
            pattern = DaxPattern::MeasureAggregation;
        }
        if pattern == DaxPattern::CalculateFilter && (groups.is_empty() || measure.is_none()) {
            pattern = DaxPattern::MeasureAggregation;
        }

        let group_list = groups.iter().map(ColumnRef::dax).join(", ");
        let direction = analysis.direction.as_str();
        let body = match pattern {
            DaxPattern::SimpleFilter => match analysis.limit {
                Some(limit) => {
                    let order = measure
                        .as_ref()
                        .map(ColumnRef::dax)
                        .or_else(|| primary.columns.first().map(|c| ColumnRef::new(primary, c).dax()));
                    match order {
                        Some(order) => format!("TOPN({}, {}, {}, {})", limit, source, order, direction),
                        None => source.clone(),
                    }
                }
                None => source.clone(),
            },
            DaxPattern::MeasureAggregation => {
                if groups.is_empty() {
                    format!("SUMMARIZE({}, \"{}\", {})", source, value.label, value.expr)
                } else {
                    format!("SUMMARIZE({}, {}, \"{}\", {})", source, group_list, value.label, value.expr)
                }
            }
            DaxPattern::TopN => {
                let limit = analysis.limit.unwrap_or(DEFAULT_TOP);
                if groups.is_empty() {
                    let order = measure
                        .as_ref()
                        .map(ColumnRef::dax)
                        .or_else(|| primary.columns.first().map(|c| ColumnRef::new(primary, c).dax()))
                        .unwrap_or_else(|| format!("COUNTROWS({})", table));
                    format!("TOPN({}, {}, {}, {})", limit, source, order, direction)
                } else {
                    format!(
                        "TOPN({}, ADDCOLUMNS(SUMMARIZE({}, {}), \"{}\", CALCULATE({})), [{}], {})",
                        limit, source, group_list, value.label, value.expr, value.label, direction
                    )
                }
            }
            DaxPattern::CalculateFilter => format!(
                "ADDCOLUMNS(SUMMARIZE({}, {}), \"{}\", CALCULATE({}), \"Share of {}\", DIVIDE(CALCULATE({}), CALCULATE({}, ALL({}))))",
                source, group_list, value.label, value.expr, value.label, value.expr, value.expr, table
            ),
            DaxPattern::TimeIntelligence => {
                let date = date.as_deref().unwrap_or_default();
                let mut periods = vec![("Year", format!("YEAR({})", date))];
                match analysis.grain {
                    TimeGrain::Quarter => periods.push(("Quarter", format!("QUARTER({})", date))),
                    TimeGrain::Month => periods.push(("Month", format!("MONTH({})", date))),
                    TimeGrain::Year => {}
                }
                let added = periods.iter().map(|(name, expr)| format!("\"{}\", {}", name, expr)).join(", ");
                let mut keys: Vec<String> = periods.iter().map(|(name, _)| format!("[{}]", name)).collect();
                keys.extend(groups.iter().map(ColumnRef::dax));
                format!(
                    "SUMMARIZE(ADDCOLUMNS({}, {}), {}, \"{}\", {})",
                    source,
                    added,
                    keys.join(", "),
                    value.label,
                    value.expr
                )
            }
        };
        let expression = format!("EVALUATE\n{}", body);

        let tables: Vec<String> = TABLE_REF
            .captures_iter(&mask_literals(&expression))
            .map(|c| c[1].to_string())
            .unique()
            .collect();
        let relationships = self
            .schema
            .relationships
            .iter()
            .filter(|r| r.from_table.eq_ignore_ascii_case(&primary.name))
            .filter(|r| tables.iter().any(|t| t.eq_ignore_ascii_case(&r.to_table)))
            .cloned()
            .collect();
        let measures = match pattern {
            DaxPattern::SimpleFilter => Vec::new(),
            _ => vec![value.expr],
        };
        let confidence = Self::confidence(&analysis, pattern);
        info!("Planned {} DAX over {} (confidence {:.2})", pattern, primary.name, confidence);

        Ok(DaxQueryPlan {
            analysis,
            pattern,
            primary_table: primary.name.clone(),
            tables,
            columns: groups,
            measures,
            filters,
            relationships,
            expression,
            confidence,
        })
    }

    /// Lightweight structural check of any DAX text against the schema.
    ///
    /// Missing `EVALUATE` and unknown names are warnings; unbalanced
    /// parentheses or brackets are errors.
    pub fn validate_generated(&self, dax: &str) -> ValidationResult {
        let masked = mask_literals(dax);
        let mut issues = Vec::new();

        if !masked.trim_start().to_uppercase().starts_with("EVALUATE") {
            issues.push(ValidationIssue::warning("Query does not start with EVALUATE").suggest("Prefix the query with EVALUATE"));
        }
        for (open, close, what) in [('(', ')', "parentheses"), ('[', ']', "brackets")] {
            let (opened, closed) = (masked.matches(open).count(), masked.matches(close).count());
            if opened != closed {
                issues.push(ValidationIssue::error(format!(
                    "Unbalanced {}: {} opening, {} closing",
                    what, opened, closed
                )));
            }
        }

        for name in TABLE_REF.captures_iter(&masked).map(|c| c[1].to_string()).unique() {
            if self.schema.table(&name).is_none() {
                issues.push(ValidationIssue::warning(format!("Unknown table '{}'", name)));
            }
        }
        for caps in COLUMN_REF.captures_iter(&masked) {
            if let Some(table) = self.schema.table(&caps[1]) {
                if table.column(&caps[2]).is_none() {
                    issues.push(ValidationIssue::warning(format!(
                        "Unknown column '{}'[{}]",
                        table.name, &caps[2]
                    )));
                }
            }
        }

        let labels: HashSet<String> = LABEL.captures_iter(dax).map(|c| c[1].to_uppercase()).collect();
        for name in BARE_REF.captures_iter(&masked).map(|c| c[1].trim().to_string()).unique() {
            if !labels.contains(&name.to_uppercase()) {
                issues.push(ValidationIssue::warning(format!("Measure [{}] is not defined in the query", name)));
            }
        }

        ValidationResult {
            is_valid: !issues.iter().any(|i| i.severity == Severity::Error),
            issues,
            corrected_query: None,
        }
    }
}
