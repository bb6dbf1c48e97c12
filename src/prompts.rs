//! Prompts for intent extraction and query generation.

use crate::intent::Intent;

pub const INTENT_SYSTEM_PROMPT: &str = r#"You are a data analyst who reads business questions about a banking data warehouse.

Extract the intent of the question and reply with a single JSON object and nothing else:

{
  "intent": "one sentence describing what the user wants",
  "entities": ["business entities or tables involved"],
  "measures": ["numeric values to aggregate"],
  "filters": ["conditions restricting the rows"],
  "group_by": ["attributes to group by"],
  "order_by": "ordering, e.g. total exposure descending",
  "limit": 10,
  "time_context": "period the question refers to, or null"
}

Use null or empty lists for anything the question does not state."#;

pub const SQL_SYSTEM_PROMPT: &str = r#"You are an expert T-SQL developer for Azure SQL Database. Generate accurate queries from the provided schema and business questions."#;

pub const DAX_SYSTEM_PROMPT: &str = r#"You are an expert Power BI DAX developer. Generate accurate DAX queries from the provided data model and business questions."#;

const SQL_RULES: &str = r#"Requirements:
1. Generate only valid T-SQL syntax for Azure SQL Database
2. Use table and column names exactly as listed in the schema above
3. Include WHERE clauses, JOINs and aggregations as needed, joining on the listed relationships
4. Use TOP instead of LIMIT for row limiting
5. Handle NULL values appropriately
6. Use square brackets for table and column names
7. Return only the SQL query without explanations or comments"#;

const DAX_RULES: &str = r#"Requirements:
1. Start the query with EVALUATE
2. Reference columns as 'Table'[Column] using names from the data model above
3. Use TOPN for ranking and row limits; ORDER BY, SELECT, WHERE and GROUP BY are not DAX
4. Start SUMMARIZE and ADDCOLUMNS from fact tables and use RELATED() for dimension attributes
5. Wrap aggregations that depend on row context in CALCULATE
6. Return only the DAX query without explanations or comments"#;

pub fn intent_prompt(question: &str) -> String {
    format!("Question: \"{}\"\n\nJSON:", question)
}

pub fn sql_prompt(question: &str, intent: &Intent, schema_context: &str) -> String {
    format!(
        "Given the following database schema and question, generate an accurate T-SQL query.\n\n\
         {}\n\
         Question: \"{}\"\n\n\
         {}\n\
         {}\n\n\
         SQL Query:",
        schema_context,
        question,
        intent.prompt_block(),
        SQL_RULES
    )
}

pub fn dax_prompt(question: &str, intent: &Intent, schema_context: &str) -> String {
    format!(
        "Given the following data model and question, generate an accurate DAX query.\n\n\
         {}\n\
         Question: \"{}\"\n\n\
         {}\n\
         {}\n\n\
         DAX Query:",
        schema_context,
        question,
        intent.prompt_block(),
        DAX_RULES
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> Intent {
        Intent {
            intent: "rank customers".to_string(),
            entities: vec!["customer".to_string(), "loan".to_string()],
            limit: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_query_prompts_carry_intent() {
        let sql = sql_prompt("top 5 customers", &intent(), "Database: banking\n");
        assert!(sql.contains("Entities: customer, loan"));
        assert!(sql.contains("Use TOP instead of LIMIT"));
        assert!(sql.ends_with("SQL Query:"));

        let dax = dax_prompt("top 5 customers", &intent(), "Data Model: banking\n");
        assert!(dax.contains("Entities: customer, loan"));
        assert!(dax.contains("Limit: 5"));
        assert!(dax.contains("RELATED()"));
        assert!(dax.ends_with("DAX Query:"));
    }

    #[test]
    fn test_intent_prompt() {
        assert_eq!(intent_prompt("why?"), "Question: \"why?\"\n\nJSON:");
        assert!(INTENT_SYSTEM_PROMPT.contains("\"group_by\""));
    }
}
