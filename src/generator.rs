//! LLM-backed query generation
//!
//! Turns a question into an [`Intent`], then into T-SQL or DAX. Model output is
//! sanitized, checked and (for DAX) repaired before it is handed to an executor.

use crate::dax::{fix_customer_aggregation, DaxValidator, PatternPlanner, ValidationResult};
use crate::error::{PipelineError, Result};
use crate::execution::QueryLanguage;
use crate::extract::{clean_dax, clean_sql, extract_dax, extract_sql};
use crate::intent::Intent;
use crate::llm::LanguageModel;
use crate::prompts;
use crate::schema::{dax_context, sql_context, DatabaseSchema};
use crate::sql_check::{validate_sql, SqlValidation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Template plans below this confidence never replace model output.
const PLAN_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedQuery {
    pub language: QueryLanguage,
    /// Model reply before extraction.
    pub raw: String,
    /// Query handed to the executor.
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_validation: Option<SqlValidation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dax_validation: Option<ValidationResult>,
    /// Rewrites applied after extraction, in order.
    pub corrections: Vec<String>,
}

impl GeneratedQuery {
    pub fn is_valid(&self) -> bool {
        match (&self.sql_validation, &self.dax_validation) {
            (Some(sql), _) => sql.is_valid,
            (_, Some(dax)) => dax.is_valid,
            _ => true,
        }
    }

    /// Error messages from whichever validator ran.
    pub fn validation_errors(&self) -> Vec<String> {
        match (&self.sql_validation, &self.dax_validation) {
            (Some(sql), _) => sql.errors.clone(),
            (_, Some(dax)) => dax.errors().map(|issue| issue.message.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

pub struct QueryGenerator<L: LanguageModel> {
    llm: L,
}

impl<L: LanguageModel> QueryGenerator<L> {
    pub fn new(llm: L) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &L {
        &self.llm
    }

    pub async fn extract_intent(&self, question: &str) -> Result<Intent> {
        let raw = self
            .llm
            .complete(prompts::INTENT_SYSTEM_PROMPT, &prompts::intent_prompt(question))
            .await?;
        let intent = Intent::parse(question, &raw);
        debug!("Parsed intent: {:?}", intent);
        Ok(intent)
    }

    pub async fn generate_sql(&self, question: &str, intent: &Intent, schema: &DatabaseSchema) -> Result<GeneratedQuery> {
        let prompt = prompts::sql_prompt(question, intent, &sql_context(schema));
        let raw = self.llm.complete(prompts::SQL_SYSTEM_PROMPT, &prompt).await?;

        let query = clean_sql(&extract_sql(&raw));
        if query.is_empty() {
            return Err(PipelineError::Validation("Model reply contained no SQL query".to_string()));
        }
        let validation = validate_sql(&query);
        if !validation.is_valid {
            warn!("Generated SQL failed validation: {}", validation.errors.join("; "));
        }
        info!("Generated SQL ({} chars)", query.len());

        Ok(GeneratedQuery {
            language: QueryLanguage::Sql,
            raw,
            query,
            sql_validation: Some(validation),
            dax_validation: None,
            corrections: Vec::new(),
        })
    }

    pub async fn generate_dax(&self, question: &str, intent: &Intent, schema: &DatabaseSchema) -> Result<GeneratedQuery> {
        let prompt = prompts::dax_prompt(question, intent, &dax_context(schema));
        let raw = self.llm.complete(prompts::DAX_SYSTEM_PROMPT, &prompt).await?;

        let mut query = clean_dax(&extract_dax(&raw));
        if query.is_empty() {
            return Err(PipelineError::Validation("Model reply contained no DAX query".to_string()));
        }
        let mut corrections = Vec::new();

        if let Some(fixed) = fix_customer_aggregation(&query, intent, schema) {
            info!("Rewrote customer aggregation to start from the fact table");
            corrections.push("Customer aggregation rewritten to summarize from the fact table".to_string());
            query = fixed;
        }

        let validator = DaxValidator::new(schema);
        let mut validation = validator.validate(&query);
        if let Some(corrected) = validation.corrected_query.clone() {
            info!("Applying DAX validator corrections");
            corrections.push("Validator corrections applied to table references".to_string());
            query = corrected;
            validation = validator.validate(&query);
        }
        if !validation.is_valid {
            warn!(
                "Generated DAX has {} validation error(s)",
                validation.errors().count()
            );
            match PatternPlanner::new(schema).plan(question, Some(intent)) {
                Ok(plan) if plan.confidence >= PLAN_CONFIDENCE => {
                    let planned = validator.validate(&plan.expression);
                    if planned.is_valid {
                        info!("Replacing invalid DAX with the {} pattern", plan.pattern);
                        corrections.push(format!(
                            "Replaced invalid DAX with the {} pattern (confidence {:.2})",
                            plan.pattern, plan.confidence
                        ));
                        query = plan.expression;
                        validation = planned;
                    }
                }
                Ok(plan) => debug!("Pattern plan confidence {:.2} too low to use", plan.confidence),
                Err(e) => debug!("No pattern plan: {}", e),
            }
        }

        Ok(GeneratedQuery {
            language: QueryLanguage::Dax,
            raw,
            query,
            sql_validation: None,
            dax_validation: Some(validation),
            corrections,
        })
    }
}
