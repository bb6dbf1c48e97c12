//! Template rewrites for known-bad DAX shapes.

use crate::intent::Intent;
use crate::schema::{ColumnInfo, DatabaseSchema, TableInfo, TableKind};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref AGGREGATION_FROM: Regex =
        Regex::new(r"(?i)\b(?:SUMMARIZE|ADDCOLUMNS|VALUES|SUMMARIZECOLUMNS)\s*\(\s*'([^']+)'").unwrap();
    static ref QUOTED_TABLE: Regex = Regex::new(r"'([^']+)'").unwrap();
}

const DEFAULT_LIMIT: u32 = 5;
const MEASURE_PREFERENCE: &[&str] = &["EXPOSURE", "AMOUNT", "BALANCE"];

pub(crate) fn preferred_measure(table: &TableInfo) -> Option<&ColumnInfo> {
    MEASURE_PREFERENCE
        .iter()
        .find_map(|word| {
            table
                .columns
                .iter()
                .find(|c| c.is_numeric() && c.name.to_uppercase().contains(word))
        })
        .or_else(|| table.measure_columns().next())
}

pub(crate) fn name_column(table: &TableInfo) -> Option<&ColumnInfo> {
    let upper = |c: &&ColumnInfo| c.name.to_uppercase();
    table
        .columns
        .iter()
        .find(|c| upper(c).ends_with("_NAME") && upper(c).contains("CUSTOMER"))
        .or_else(|| table.columns.iter().find(|c| upper(c).contains("NAME")))
}

/// Rewrite customer rankings that aggregate from the customer dimension into the
/// fact-first shape: summarize the fact table by the customer key, then sum facts.
///
/// Returns `None` when the query does not have that shape or the schema has no
/// fact table, key, name column or measure to build the rewrite from.
pub fn fix_customer_aggregation(query: &str, intent: &Intent, schema: &DatabaseSchema) -> Option<String> {
    if !intent.mentions(&["customer", "exposure", "client"]) {
        return None;
    }

    let dim = AGGREGATION_FROM
        .captures_iter(query)
        .filter_map(|c| schema.table(&c[1]))
        .find(|t| t.kind == TableKind::Dimension && t.name.to_uppercase().contains("CUSTOMER"))?;

    let referenced: Vec<String> = QUOTED_TABLE
        .captures_iter(query)
        .map(|c| c[1].to_uppercase())
        .collect();

    // Facts with a foreign key into the dimension, query-referenced ones first.
    let mut links: Vec<(&TableInfo, &str, &str)> = schema
        .relationships
        .iter()
        .filter(|r| r.to_table.eq_ignore_ascii_case(&dim.name))
        .filter_map(|r| {
            schema
                .table(&r.from_table)
                .filter(|t| t.kind == TableKind::Fact)
                .map(|t| (t, r.from_column.as_str(), r.to_column.as_str()))
        })
        .collect();
    links.sort_by_key(|(t, _, _)| !referenced.contains(&t.name.to_uppercase()));
    links.dedup_by(|a, b| a.0.name == b.0.name);

    let mut measures = links
        .iter()
        .filter_map(|(fact, _, dim_key)| preferred_measure(*fact).map(|m| (*fact, *dim_key, m)))
        .take(2);
    let (fact, dim_key, measure) = measures.next()?;
    let second = measures.next();
    let name = name_column(dim)?;
    let limit = intent.limit.unwrap_or(DEFAULT_LIMIT);

    let mut total = format!("CALCULATE(SUM('{}'[{}]))", fact.name, measure.name);
    if let Some((fact2, _, measure2)) = second {
        total.push_str(&format!(" + CALCULATE(SUM('{}'[{}]))", fact2.name, measure2.name));
    }

    Some(format!(
        "EVALUATE\nTOPN(\n    {limit},\n    ADDCOLUMNS(\n        SUMMARIZE('{fact}', '{dim}'[{key}], '{dim}'[{name}]),\n        \"TotalExposure\", {total}\n    ),\n    [TotalExposure], DESC\n)",
        limit = limit,
        fact = fact.name,
        dim = dim.name,
        key = dim_key,
        name = name.name,
        total = total,
    ))
}

/// Plain-language hints for SQL habits that do not carry over to DAX.
pub fn suggest_improvements(query: &str) -> Vec<String> {
    let upper = query.to_uppercase();
    let mut suggestions = Vec::new();

    if !upper.trim_start().starts_with("EVALUATE") && !upper.trim_start().starts_with("DEFINE") {
        suggestions.push("Start the query with EVALUATE".to_string());
    }
    if !query.contains('[') {
        suggestions.push("Reference columns as 'Table'[Column]".to_string());
    }
    if upper.contains("SELECT ") && !upper.contains("SELECTCOLUMNS") {
        suggestions.push("DAX has no SELECT; use SELECTCOLUMNS() or ADDCOLUMNS()".to_string());
    }
    if upper.contains("WHERE") && !upper.contains("FILTER") {
        suggestions.push("Use FILTER() instead of WHERE".to_string());
    }
    if upper.contains("GROUP BY") && !upper.contains("SUMMARIZE") {
        suggestions.push("Use SUMMARIZE() or SUMMARIZECOLUMNS() instead of GROUP BY".to_string());
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dax::DaxValidator;
    use crate::schema::model::fixtures::banking_schema;

    const DIMENSION_FIRST: &str = "EVALUATE TOPN(10, ADDCOLUMNS(SUMMARIZE('DIM_CUSTOMER', 'DIM_CUSTOMER'[CUSTOMER_NAME]), \"Total\", CALCULATE(SUM('FACT_LOAN'[PRINCIPAL_AMOUNT_USD]))), [Total], DESC)";

    #[test]
    fn test_rewrites_dimension_first_ranking() {
        let schema = banking_schema();
        let intent = Intent::from_question("top 3 customers by total exposure");
        let fixed = fix_customer_aggregation(DIMENSION_FIRST, &intent, &schema).unwrap();

        assert!(fixed.contains("    3,\n"));
        assert!(fixed.contains("SUMMARIZE('FACT_LOAN', 'DIM_CUSTOMER'[CUSTOMER_KEY], 'DIM_CUSTOMER'[CUSTOMER_NAME])"));
        assert!(fixed.contains(
            "CALCULATE(SUM('FACT_LOAN'[PRINCIPAL_AMOUNT_USD])) + CALCULATE(SUM('FACT_CREDIT_ARRANGEMENT'[EXPOSURE_AMOUNT]))"
        ));

        let result = DaxValidator::new(&schema).validate(&fixed);
        assert!(result.is_valid, "{:?}", result.issues);
    }

    #[test]
    fn test_default_limit() {
        let schema = banking_schema();
        let intent = Intent::from_question("customers with the biggest exposure");
        let fixed = fix_customer_aggregation(DIMENSION_FIRST, &intent, &schema).unwrap();
        assert!(fixed.contains("    5,\n"));
    }

    #[test]
    fn test_no_rewrite_without_customer_intent_or_shape() {
        let schema = banking_schema();
        let intent = Intent::from_question("loans per month");
        assert!(fix_customer_aggregation(DIMENSION_FIRST, &intent, &schema).is_none());

        let intent = Intent::from_question("top customers");
        let fact_first = "EVALUATE SUMMARIZE('FACT_LOAN', 'FACT_LOAN'[CUSTOMER_KEY])";
        assert!(fix_customer_aggregation(fact_first, &intent, &schema).is_none());
    }

    #[test]
    fn test_suggest_improvements() {
        let hints = suggest_improvements("SELECT name FROM customers WHERE x = 1 GROUP BY name");
        assert_eq!(hints.len(), 5);
        assert!(suggest_improvements("EVALUATE FILTER('T', 'T'[a] = 1)").is_empty());
    }
}
