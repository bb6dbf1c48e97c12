//! DAX to T-SQL translation for the table-expression subset generated queries use.
//!
//! Lets generated DAX run against the SQL source when no Power BI dataset is
//! configured. Every table expression becomes a derived table aliased with the
//! DAX name of its base table, so `'Table'[Column]` references keep resolving
//! as `[Table].[Column]` at any nesting depth.

use crate::dax::{matching_paren, split_args};
use crate::error::{PipelineError, Result};
use crate::schema::DatabaseSchema;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref EVALUATE: Regex = Regex::new(r"(?is)^EVALUATE\s+(.+)$").unwrap();
    static ref CALL: Regex = Regex::new(r"^([A-Za-z][A-Za-z0-9_.]*)\s*\(").unwrap();
    static ref QUOTED_TABLE: Regex = Regex::new(r"^'([^']+)'$").unwrap();
    static ref BARE_TABLE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref COLUMN: Regex = Regex::new(r"^(?:'([^']+)')?\[([^\]]+)\]$").unwrap();
    static ref CALCULATE: Regex = Regex::new(r"(?i)\bCALCULATE\s*\(").unwrap();
    static ref RELATED: Regex = Regex::new(r"(?i)\bRELATED\s*\(").unwrap();
    static ref COUNTROWS: Regex = Regex::new(r"(?i)\bCOUNTROWS\s*\(\s*(?:'[^']+'|\w+)\s*\)").unwrap();
    static ref DISTINCTCOUNT: Regex = Regex::new(r"(?i)\bDISTINCTCOUNT\s*\(").unwrap();
    static ref AVERAGE: Regex = Regex::new(r"(?i)\bAVERAGE\s*\(").unwrap();
    static ref TRUE_CALL: Regex = Regex::new(r"(?i)\bTRUE\s*\(\s*\)").unwrap();
    static ref FALSE_CALL: Regex = Regex::new(r"(?i)\bFALSE\s*\(\s*\)").unwrap();
    static ref BLANK_COMPARISON: Regex = Regex::new(r"(?i)(<>|==?)\s*BLANK\s*\(\s*\)").unwrap();
    static ref BLANK_CALL: Regex = Regex::new(r"(?i)\bBLANK\s*\(\s*\)").unwrap();
    static ref AGGREGATE: Regex = Regex::new(r"(?i)\b(SUM|AVG|MIN|MAX|COUNT)\s*\(").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

fn unsupported(message: impl Into<String>) -> PipelineError {
    PipelineError::Translation(message.into())
}

fn ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn string_literal(arg: &str) -> Option<&str> {
    let arg = arg.trim();
    (arg.len() >= 2 && arg.starts_with('"') && arg.ends_with('"')).then(|| &arg[1..arg.len() - 1])
}

enum Source {
    Table { schema: String },
    Query(String),
}

struct Relation {
    /// DAX name of the table the rows come from; also the SQL alias.
    base: String,
    source: Source,
}

impl Relation {
    fn from_clause(&self) -> String {
        match &self.source {
            Source::Table { schema } => format!("{}.{} AS {}", ident(schema), ident(&self.base), ident(&self.base)),
            Source::Query(sql) => format!("({}) AS {}", sql, ident(&self.base)),
        }
    }

    fn derived(&self, sql: String) -> Relation {
        Relation {
            base: self.base.clone(),
            source: Source::Query(sql),
        }
    }

    fn into_query(self) -> String {
        match self.source {
            Source::Table { .. } => format!("SELECT * FROM {}", self.from_clause()),
            Source::Query(sql) => sql,
        }
    }
}

/// Tables a scalar expression may reference.
struct Scope<'r> {
    relation: &'r Relation,
    tables: Vec<String>,
}

impl<'r> Scope<'r> {
    fn new(relation: &'r Relation) -> Self {
        Self {
            relation,
            tables: vec![relation.base.clone()],
        }
    }

    fn column(&self, table: Option<&str>, column: &str) -> Result<String> {
        let base = &self.relation.base;
        match (&self.relation.source, table) {
            (Source::Query(_), _) | (_, None) => Ok(format!("{}.{}", ident(base), ident(column))),
            (Source::Table { .. }, Some(table)) => self
                .tables
                .iter()
                .find(|t| t.eq_ignore_ascii_case(table))
                .map(|t| format!("{}.{}", ident(t), ident(column)))
                .ok_or_else(|| unsupported(format!("'{}'[{}] is not reachable from '{}'", table, column, base))),
        }
    }
}

struct Translator<'a> {
    schema: &'a DatabaseSchema,
}

impl<'a> Translator<'a> {
    fn table(&self, expr: &str) -> Result<Relation> {
        let expr = expr.trim();
        if let Some(name) = QUOTED_TABLE
            .captures(expr)
            .map(|c| c[1].to_string())
            .or_else(|| BARE_TABLE.is_match(expr).then(|| expr.to_string()))
        {
            let table = self
                .schema
                .table(&name)
                .ok_or_else(|| unsupported(format!("Unknown table '{}'", name)))?;
            return Ok(Relation {
                base: table.name.clone(),
                source: Source::Table {
                    schema: table.schema.clone(),
                },
            });
        }

        let (function, args) = call(expr)?;
        match function.to_uppercase().as_str() {
            "FILTER" => self.filter(&args),
            "TOPN" => self.topn(&args),
            "SUMMARIZE" => self.summarize(&args, &[]),
            "ADDCOLUMNS" => self.add_columns(&args),
            "SELECTCOLUMNS" => self.select_columns(&args),
            other => Err(unsupported(format!("{} cannot be translated to SQL", other))),
        }
    }

    fn filter(&self, args: &[&str]) -> Result<Relation> {
        if args.len() != 2 {
            return Err(unsupported("FILTER takes a table and one condition"));
        }
        let inner = self.table(args[0])?;
        let condition = scalar(args[1], &Scope::new(&inner))?;
        let sql = format!("SELECT * FROM {} WHERE {}", inner.from_clause(), condition);
        Ok(inner.derived(sql))
    }

    fn topn(&self, args: &[&str]) -> Result<Relation> {
        if args.len() < 2 {
            return Err(unsupported("TOPN takes a row count and a table"));
        }
        let count: u64 = args[0]
            .trim()
            .parse()
            .map_err(|_| unsupported(format!("TOPN row count must be a number, got '{}'", args[0])))?;
        let inner = self.table(args[1])?;
        let scope = Scope::new(&inner);

        let mut order = Vec::new();
        let mut rest = args[2..].iter().peekable();
        while let Some(expr) = rest.next() {
            // DAX TOPN ranks descending unless told otherwise.
            let direction = match rest.peek().map(|d| d.trim().to_uppercase()) {
                Some(d) if d == "ASC" || d == "DESC" => {
                    rest.next();
                    d
                }
                _ => "DESC".to_string(),
            };
            order.push(format!("{} {}", scalar(expr, &scope)?, direction));
        }

        // TOPN keeps every row tied with the last one.
        let sql = if order.is_empty() {
            format!("SELECT TOP ({}) * FROM {}", count, inner.from_clause())
        } else {
            format!(
                "SELECT TOP ({}) WITH TIES * FROM {} ORDER BY {}",
                count,
                inner.from_clause(),
                order.join(", ")
            )
        };
        Ok(inner.derived(sql))
    }

    fn summarize(&self, args: &[&str], extra: &[&str]) -> Result<Relation> {
        let (table, rest) = args
            .split_first()
            .ok_or_else(|| unsupported("SUMMARIZE needs a table"))?;
        let inner = self.table(table)?;
        let mut scope = Scope::new(&inner);
        let mut joins = Vec::new();

        let split = rest.iter().position(|a| string_literal(a).is_some()).unwrap_or(rest.len());
        let mut groups = Vec::new();
        for arg in &rest[..split] {
            let caps = COLUMN
                .captures(arg.trim())
                .ok_or_else(|| unsupported(format!("SUMMARIZE group-by must be a column, got '{}'", arg)))?;
            let (table, column) = (caps.get(1).map(|m| m.as_str()), caps[2].to_string());
            if let (Source::Table { .. }, Some(table)) = (&inner.source, table) {
                if !scope.tables.iter().any(|t| t.eq_ignore_ascii_case(table)) {
                    let (name, join) = self.join(&inner.base, table)?;
                    joins.push(join);
                    scope.tables.push(name);
                }
            }
            groups.push((scope.column(table, &column)?, column));
        }

        let pairs: Vec<&str> = rest[split..].iter().chain(extra.iter()).copied().collect();
        let aggregates = named_expressions(&pairs, &scope)?;

        let mut select: Vec<String> = groups.iter().map(|(sql, name)| format!("{} AS {}", sql, ident(name))).collect();
        select.extend(aggregates);
        if select.is_empty() {
            return Err(unsupported("SUMMARIZE without columns"));
        }

        let distinct = if pairs.is_empty() { "DISTINCT " } else { "" };
        let mut sql = format!("SELECT {}{} FROM {}", distinct, select.join(", "), inner.from_clause());
        for join in &joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !pairs.is_empty() && !groups.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", groups.iter().map(|(sql, _)| sql).join(", ")));
        }
        Ok(inner.derived(sql))
    }

    /// Join clause from `base` to a directly related table.
    fn join(&self, base: &str, other: &str) -> Result<(String, String)> {
        let target = self
            .schema
            .table(other)
            .ok_or_else(|| unsupported(format!("Unknown table '{}'", other)))?;
        let on = self.schema.relationships.iter().find_map(|r| {
            if r.from_table.eq_ignore_ascii_case(base) && r.to_table.eq_ignore_ascii_case(&target.name) {
                Some((&r.from_column, &r.to_column))
            } else if r.from_table.eq_ignore_ascii_case(&target.name) && r.to_table.eq_ignore_ascii_case(base) {
                Some((&r.to_column, &r.from_column))
            } else {
                None
            }
        });
        let (base_column, target_column) =
            on.ok_or_else(|| unsupported(format!("No relationship between '{}' and '{}'", base, target.name)))?;
        let join = format!(
            "JOIN {}.{} AS {} ON {}.{} = {}.{}",
            ident(&target.schema),
            ident(&target.name),
            ident(&target.name),
            ident(base),
            ident(base_column),
            ident(&target.name),
            ident(target_column)
        );
        Ok((target.name.clone(), join))
    }

    fn add_columns(&self, args: &[&str]) -> Result<Relation> {
        let (table, pairs) = args
            .split_first()
            .ok_or_else(|| unsupported("ADDCOLUMNS needs a table"))?;
        if let Ok((function, inner_args)) = call(table.trim()) {
            if function.eq_ignore_ascii_case("SUMMARIZE") {
                return self.summarize(&inner_args, pairs);
            }
        }

        let inner = self.table(table)?;
        let columns = named_expressions(pairs, &Scope::new(&inner))?;
        if columns.iter().any(|c| AGGREGATE.is_match(c)) {
            return Err(unsupported("Aggregations in ADDCOLUMNS are only translated over SUMMARIZE"));
        }
        let sql = format!(
            "SELECT {}.*, {} FROM {}",
            ident(&inner.base),
            columns.join(", "),
            inner.from_clause()
        );
        Ok(inner.derived(sql))
    }

    fn select_columns(&self, args: &[&str]) -> Result<Relation> {
        let (table, pairs) = args
            .split_first()
            .ok_or_else(|| unsupported("SELECTCOLUMNS needs a table"))?;
        let inner = self.table(table)?;
        let columns = named_expressions(pairs, &Scope::new(&inner))?;
        if columns.is_empty() {
            return Err(unsupported("SELECTCOLUMNS without columns"));
        }
        let sql = format!("SELECT {} FROM {}", columns.join(", "), inner.from_clause());
        Ok(inner.derived(sql))
    }
}

/// `(function, arguments)` of an expression that is exactly one call.
fn call(expr: &str) -> Result<(String, Vec<&str>)> {
    let m = CALL
        .captures(expr)
        .ok_or_else(|| unsupported(format!("Cannot translate '{}'", crate::llm::truncate(expr, 60))))?;
    let function = m[1].to_string();
    let open = m.get(0).map(|g| g.end() - 1).unwrap_or(0);
    let close = matching_paren(expr, open).ok_or_else(|| unsupported(format!("Unbalanced parentheses in {}", function)))?;
    if !expr[close + 1..].trim().is_empty() {
        return Err(unsupported(format!("Unexpected text after {}(...)", function)));
    }
    Ok((function, split_args(&expr[open + 1..close])))
}

/// `"Name", expr` pairs rendered as `expr AS [Name]`.
fn named_expressions(pairs: &[&str], scope: &Scope<'_>) -> Result<Vec<String>> {
    if pairs.len() % 2 != 0 {
        return Err(unsupported("Expected \"Name\", expression pairs"));
    }
    pairs
        .chunks(2)
        .map(|pair| {
            let name = string_literal(pair[0])
                .ok_or_else(|| unsupported(format!("Column name must be a string literal, got '{}'", pair[0])))?;
            Ok(format!("{} AS {}", scalar(pair[1], scope)?, ident(name)))
        })
        .collect()
}

/// Drop single-argument CALCULATE wrappers; filter arguments have no SQL equivalent here.
fn unwrap_calculate(expr: &str) -> Result<String> {
    let mut text = expr.to_string();
    while let Some((start, open)) = CALCULATE.find(&text).map(|m| (m.start(), m.end() - 1)) {
        let close = matching_paren(&text, open).ok_or_else(|| unsupported("Unbalanced parentheses in CALCULATE"))?;
        let args = split_args(&text[open + 1..close]);
        if args.len() != 1 {
            return Err(unsupported("CALCULATE with filter arguments cannot be translated to SQL"));
        }
        let inner = format!("({})", args[0]);
        text.replace_range(start..=close, &inner);
    }
    Ok(text)
}

fn read_until(chars: &[char], start: usize, end: char) -> Option<(String, usize)> {
    let offset = chars[start..].iter().position(|c| *c == end)?;
    Some((chars[start..start + offset].iter().collect(), start + offset + 1))
}

/// Translate a scalar DAX expression (conditions, aggregates, column references).
fn scalar(expr: &str, scope: &Scope<'_>) -> Result<String> {
    let text = unwrap_calculate(expr.trim())?;
    let text = RELATED.replace_all(&text, "(");
    let text = COUNTROWS.replace_all(&text, "COUNT(*)");
    let text = DISTINCTCOUNT.replace_all(&text, "COUNT(DISTINCT ");
    let text = AVERAGE.replace_all(&text, "AVG(");
    let text = TRUE_CALL.replace_all(&text, "1");
    let text = FALSE_CALL.replace_all(&text, "0");
    let text = BLANK_COMPARISON.replace_all(&text, |c: &regex::Captures| {
        if &c[1] == "<>" {
            "IS NOT NULL"
        } else {
            "IS NULL"
        }
    });
    let text = BLANK_CALL.replace_all(&text, "NULL");

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' => {
                let (table, next) =
                    read_until(&chars, i + 1, '\'').ok_or_else(|| unsupported("Unterminated table name"))?;
                if chars.get(next) != Some(&'[') {
                    return Err(unsupported(format!("Table '{}' used as a value", table)));
                }
                let (column, next) =
                    read_until(&chars, next + 1, ']').ok_or_else(|| unsupported("Unterminated column reference"))?;
                out.push_str(&scope.column(Some(&table), &column)?);
                i = next;
            }
            '[' => {
                let (column, next) =
                    read_until(&chars, i + 1, ']').ok_or_else(|| unsupported("Unterminated column reference"))?;
                out.push_str(&scope.column(None, &column)?);
                i = next;
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match (chars.get(i), chars.get(i + 1)) {
                        (Some('"'), Some('"')) => {
                            value.push('"');
                            i += 2;
                        }
                        (Some('"'), _) => {
                            i += 1;
                            break;
                        }
                        (Some(c), _) => {
                            value.push(*c);
                            i += 1;
                        }
                        (None, _) => return Err(unsupported("Unterminated string literal")),
                    }
                }
                out.push_str(&format!("'{}'", value.replace('\'', "''")));
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                out.push_str(" AND ");
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                out.push_str(" OR ");
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                out.push('=');
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(WHITESPACE.replace_all(out.trim(), " ").to_string())
}

/// Translate an `EVALUATE` query into one T-SQL `SELECT`.
pub fn translate_dax_to_sql(query: &str, schema: &DatabaseSchema) -> Result<String> {
    let text = query.trim().trim_end_matches(';').trim();
    let body = EVALUATE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| unsupported("Only EVALUATE queries can be translated to SQL"))?;
    let translator = Translator { schema };
    Ok(translator.table(body)?.into_query())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::fixtures::banking_schema;

    fn translate(query: &str) -> Result<String> {
        translate_dax_to_sql(query, &banking_schema())
    }

    #[test]
    fn test_table_reference() {
        assert_eq!(
            translate("EVALUATE 'fact_loan'").unwrap(),
            "SELECT * FROM [dbo].[FACT_LOAN] AS [FACT_LOAN]"
        );
    }

    #[test]
    fn test_filter_condition() {
        let sql = translate(
            "EVALUATE FILTER('DIM_CUSTOMER', 'DIM_CUSTOMER'[SEGMENT] == \"Retail's\" && [CUSTOMER_KEY] > 10 || TRUE())",
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM [dbo].[DIM_CUSTOMER] AS [DIM_CUSTOMER] WHERE [DIM_CUSTOMER].[SEGMENT] = 'Retail''s' AND [DIM_CUSTOMER].[CUSTOMER_KEY] > 10 OR 1"
        );
    }

    #[test]
    fn test_topn_over_filter() {
        let sql = translate(
            "EVALUATE TOPN(10, FILTER('FACT_LOAN', 'FACT_LOAN'[PRINCIPAL_AMOUNT_USD] > 0), 'FACT_LOAN'[PRINCIPAL_AMOUNT_USD])",
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT TOP (10) WITH TIES * FROM (SELECT * FROM [dbo].[FACT_LOAN] AS [FACT_LOAN] WHERE [FACT_LOAN].[PRINCIPAL_AMOUNT_USD] > 0) AS [FACT_LOAN] ORDER BY [FACT_LOAN].[PRINCIPAL_AMOUNT_USD] DESC"
        );
    }

    #[test]
    fn test_topn_keeps_ties_only_when_ordered() {
        assert_eq!(
            translate("EVALUATE TOPN(3, 'DIM_CUSTOMER')").unwrap(),
            "SELECT TOP (3) * FROM [dbo].[DIM_CUSTOMER] AS [DIM_CUSTOMER]"
        );
        let sql = translate("EVALUATE TOPN(3, 'DIM_CUSTOMER', 'DIM_CUSTOMER'[CUSTOMER_NAME], ASC)").unwrap();
        assert_eq!(
            sql,
            "SELECT TOP (3) WITH TIES * FROM [dbo].[DIM_CUSTOMER] AS [DIM_CUSTOMER] ORDER BY [DIM_CUSTOMER].[CUSTOMER_NAME] ASC"
        );
    }

    #[test]
    fn test_summarize_distinct_and_grouped() {
        assert_eq!(
            translate("EVALUATE SUMMARIZE('DIM_CUSTOMER', 'DIM_CUSTOMER'[SEGMENT])").unwrap(),
            "SELECT DISTINCT [DIM_CUSTOMER].[SEGMENT] AS [SEGMENT] FROM [dbo].[DIM_CUSTOMER] AS [DIM_CUSTOMER]"
        );

        let sql = translate(
            "EVALUATE SUMMARIZE('FACT_LOAN', 'DIM_CUSTOMER'[SEGMENT], \"Loans\", COUNTROWS('FACT_LOAN'), \"Avg\", AVERAGE('FACT_LOAN'[PRINCIPAL_AMOUNT_USD]))",
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT [DIM_CUSTOMER].[SEGMENT] AS [SEGMENT], COUNT(*) AS [Loans], AVG([FACT_LOAN].[PRINCIPAL_AMOUNT_USD]) AS [Avg] \
             FROM [dbo].[FACT_LOAN] AS [FACT_LOAN] \
             JOIN [dbo].[DIM_CUSTOMER] AS [DIM_CUSTOMER] ON [FACT_LOAN].[CUSTOMER_KEY] = [DIM_CUSTOMER].[CUSTOMER_KEY] \
             GROUP BY [DIM_CUSTOMER].[SEGMENT]"
        );
    }

    #[test]
    fn test_ranked_customer_totals() {
        let sql = translate(
            "EVALUATE\nTOPN(\n    5,\n    ADDCOLUMNS(\n        SUMMARIZE('FACT_LOAN', 'DIM_CUSTOMER'[CUSTOMER_KEY], 'DIM_CUSTOMER'[CUSTOMER_NAME]),\n        \"TotalExposure\", CALCULATE(SUM('FACT_LOAN'[PRINCIPAL_AMOUNT_USD]))\n    ),\n    [TotalExposure], DESC\n)",
        )
        .unwrap();
        assert!(sql.starts_with("SELECT TOP (5) WITH TIES * FROM (SELECT [DIM_CUSTOMER].[CUSTOMER_KEY] AS [CUSTOMER_KEY]"));
        assert!(sql.contains("(SUM([FACT_LOAN].[PRINCIPAL_AMOUNT_USD])) AS [TotalExposure]"));
        assert!(sql.contains("GROUP BY [DIM_CUSTOMER].[CUSTOMER_KEY], [DIM_CUSTOMER].[CUSTOMER_NAME]"));
        assert!(sql.ends_with(") AS [FACT_LOAN] ORDER BY [FACT_LOAN].[TotalExposure] DESC"));
    }

    #[test]
    fn test_selectcolumns() {
        let sql = translate(
            "EVALUATE SELECTCOLUMNS(FILTER('DIM_CUSTOMER', 'DIM_CUSTOMER'[SEGMENT] <> BLANK()), \"Name\", 'DIM_CUSTOMER'[CUSTOMER_NAME])",
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT [DIM_CUSTOMER].[CUSTOMER_NAME] AS [Name] FROM (SELECT * FROM [dbo].[DIM_CUSTOMER] AS [DIM_CUSTOMER] WHERE [DIM_CUSTOMER].[SEGMENT] IS NOT NULL) AS [DIM_CUSTOMER]"
        );
    }

    #[test]
    fn test_unsupported_shapes() {
        let cases = [
            "'FACT_LOAN'",
            "EVALUATE ROW(\"x\", 1)",
            "EVALUATE 'NOPE'",
            "EVALUATE TOPN(n, 'FACT_LOAN')",
            "EVALUATE SUMMARIZE('FACT_LOAN', 'DIM_DATE'[CALENDAR_DATE], \"x\", CALCULATE(SUM('FACT_LOAN'[PRINCIPAL_AMOUNT_USD]), 'DIM_DATE'[DATE_KEY] > 1))",
            "EVALUATE FILTER('DIM_CUSTOMER', 'FACT_LOAN'[LOAN_ID] > 1)",
            "EVALUATE SUMMARIZE('DIM_DATE', 'DIM_CUSTOMER'[SEGMENT])",
        ];
        for case in cases {
            let err = translate(case).unwrap_err();
            assert!(matches!(err, PipelineError::Translation(_)), "{}: {}", case, err);
        }
    }
}
