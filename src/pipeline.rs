//! End-to-end question answering
//!
//! One run walks the stages in order: query cache, schema, intent, SQL and DAX
//! generation, execution, comparison. A failing stage records its error and the
//! run carries on with every stage that does not depend on it.

use crate::cache::{connection_hash, QueryCache, SchemaCache};
use crate::compare::{compare_results, ResultComparison};
use crate::config::{PipelineConfig, PipelineSettings};
use crate::error::{PipelineError, Result};
use crate::execution::{
    dax_executor_for, AzureSqlExecutor, QueryExecutor, QueryLanguage, QueryResult, RetryPolicy, SqlBackedDaxExecutor,
};
use crate::generator::{GeneratedQuery, QueryGenerator};
use crate::intent::Intent;
use crate::llm::{LanguageModel, LlmClient};
use crate::schema::{DatabaseSchema, SchemaDiscovery};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Sql,
    Dax,
    Both,
}

impl PipelineMode {
    pub fn wants_sql(self) -> bool {
        matches!(self, PipelineMode::Sql | PipelineMode::Both)
    }

    pub fn wants_dax(self) -> bool {
        matches!(self, PipelineMode::Dax | PipelineMode::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineMode::Sql => "sql",
            PipelineMode::Dax => "dax",
            PipelineMode::Both => "both",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub mode: PipelineMode,
    pub execute: bool,
    pub use_cache: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Both,
            execute: true,
            use_cache: true,
        }
    }
}

/// Everything one run produced. Serialized as the run record and the query cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub execution_id: String,
    pub question: String,
    pub mode: PipelineMode,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub intent: Option<Intent>,
    pub sql: Option<GeneratedQuery>,
    pub dax: Option<GeneratedQuery>,
    pub sql_result: Option<QueryResult>,
    pub dax_result: Option<QueryResult>,
    pub comparison: Option<ResultComparison>,
    /// Seconds per stage, plus `total`.
    pub timings: BTreeMap<String, f64>,
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub cache_timestamp: Option<String>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
}

impl PipelineRun {
    fn new(question: &str, mode: PipelineMode) -> Self {
        Self {
            execution_id: new_execution_id(),
            question: question.to_string(),
            mode,
            timestamp: Utc::now(),
            success: false,
            intent: None,
            sql: None,
            dax: None,
            sql_result: None,
            dax_result: None,
            comparison: None,
            timings: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            from_cache: false,
            cache_timestamp: None,
            output_file: None,
        }
    }

    fn time(&mut self, stage: &str, started: Instant) {
        self.timings.insert(stage.to_string(), started.elapsed().as_secs_f64());
    }

    fn fail(&mut self, message: String) {
        error!("{}", message);
        self.errors.push(message);
    }

    pub fn total_seconds(&self) -> f64 {
        self.timings.get("total").copied().unwrap_or_default()
    }
}

/// `run_{YYYYmmdd_HHMMSS}_{first 8 hex of a v4 uuid}`.
pub fn new_execution_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", Local::now().format("%Y%m%d_%H%M%S"), &uuid[..8])
}

/// Schema from the schema cache, else discovered over `sql` and saved back to the cache.
pub async fn load_schema(
    settings: &PipelineSettings,
    sql: Option<&dyn QueryExecutor>,
    connection_params: &BTreeMap<String, String>,
    refresh: bool,
) -> Result<DatabaseSchema> {
    let cache = match SchemaCache::new(settings.schema_cache_dir()) {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!("Schema cache unavailable: {}", e);
            None
        }
    };

    if !refresh && !connection_params.is_empty() {
        if let Some(cached) = cache
            .as_ref()
            .and_then(|c| c.load(connection_params, settings.schema_max_age_hours))
        {
            return Ok(cached.schema);
        }
    }

    let executor =
        sql.ok_or_else(|| PipelineError::Schema("No SQL connection configured for schema discovery".to_string()))?;
    let database = connection_params
        .get("database")
        .cloned()
        .unwrap_or_else(|| "database".to_string());
    let schema = SchemaDiscovery::new(executor, database).discover().await?;
    if let Some(cache) = &cache {
        if let Err(e) = cache.save(connection_params, &schema) {
            warn!("Failed to cache schema: {}", e);
        }
    }
    Ok(schema)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigurationStatus {
    pub sql_connection: bool,
    pub llm_connection: bool,
    pub schema_access: bool,
    /// Executor that will run DAX, if any.
    pub dax_executor: Option<String>,
    pub messages: Vec<String>,
}

impl ConfigurationStatus {
    pub fn is_ready(&self) -> bool {
        self.llm_connection && self.schema_access
    }
}

pub struct Nl2DaxPipeline<L: LanguageModel> {
    generator: QueryGenerator<L>,
    settings: PipelineSettings,
    sql_executor: Option<Arc<dyn QueryExecutor>>,
    dax_executor: Option<Arc<dyn QueryExecutor>>,
    connection_params: BTreeMap<String, String>,
    schema: RwLock<Option<Arc<DatabaseSchema>>>,
}

impl Nl2DaxPipeline<LlmClient> {
    /// Wire the real clients from configuration. Only the LLM section is required.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let llm_settings = config.llm.clone().ok_or_else(|| {
            PipelineError::Config(format!(
                "LLM is not configured; set {}",
                config.missing(&[crate::config::Section::Llm]).join(", ")
            ))
        })?;
        let llm = LlmClient::new(llm_settings)?
            .with_temperature(config.pipeline.llm_temperature)
            .with_max_tokens(config.pipeline.llm_max_tokens);
        info!("Using LLM model {}", llm.model_name());
        let mut pipeline = Self::new(llm, config.pipeline.clone());

        if let Some(sql) = &config.sql {
            let params = sql.connection_params();
            pipeline = pipeline.with_sql_executor(Arc::new(AzureSqlExecutor::new(sql.clone())), params);
        } else {
            warn!("Azure SQL is not configured; SQL execution and schema discovery are unavailable");
        }

        if let Some(power_bi) = &config.power_bi {
            let retry = RetryPolicy::new(config.pipeline.dax_retries, Duration::from_millis(800));
            pipeline = pipeline.with_dax_executor(dax_executor_for(power_bi, retry)?);
        }
        Ok(pipeline)
    }
}

impl<L: LanguageModel> Nl2DaxPipeline<L> {
    pub fn new(llm: L, settings: PipelineSettings) -> Self {
        Self {
            generator: QueryGenerator::new(llm),
            settings,
            sql_executor: None,
            dax_executor: None,
            connection_params: BTreeMap::new(),
            schema: RwLock::new(None),
        }
    }

    pub fn with_sql_executor(mut self, executor: Arc<dyn QueryExecutor>, connection_params: BTreeMap<String, String>) -> Self {
        self.sql_executor = Some(executor);
        self.connection_params = connection_params;
        self
    }

    pub fn with_dax_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.dax_executor = Some(executor);
        self
    }

    /// Use a fixed schema instead of the cache and discovery.
    pub fn with_schema(self, schema: DatabaseSchema) -> Self {
        if let Ok(mut slot) = self.schema.write() {
            *slot = Some(Arc::new(schema));
        }
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn generator(&self) -> &QueryGenerator<L> {
        &self.generator
    }

    fn cached_schema(&self) -> Option<Arc<DatabaseSchema>> {
        self.schema.read().ok().and_then(|s| s.clone())
    }

    /// Schema from memory, the schema cache, or discovery (saved back to the cache).
    pub async fn schema(&self, refresh: bool) -> Result<Arc<DatabaseSchema>> {
        if !refresh {
            if let Some(schema) = self.cached_schema() {
                return Ok(schema);
            }
        }

        let schema = load_schema(
            &self.settings,
            self.sql_executor.as_deref(),
            &self.connection_params,
            refresh,
        )
        .await?;
        let schema = Arc::new(schema);
        if let Ok(mut slot) = self.schema.write() {
            *slot = Some(schema.clone());
        }
        Ok(schema)
    }

    /// Executor for DAX: the configured one, else DAX translated onto the SQL connection.
    fn dax_executor(&self, schema: &Arc<DatabaseSchema>) -> Option<Arc<dyn QueryExecutor>> {
        self.dax_executor.clone().or_else(|| {
            self.sql_executor.clone().map(|sql| {
                Arc::new(SqlBackedDaxExecutor::new(sql, schema.clone())) as Arc<dyn QueryExecutor>
            })
        })
    }

    fn query_cache(&self) -> Option<QueryCache> {
        if !self.settings.enable_query_cache {
            return None;
        }
        match QueryCache::new(self.settings.query_cache_dir(), self.settings.query_cache_ttl_secs) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("Query cache unavailable: {}", e);
                None
            }
        }
    }

    /// Query cache scope: the schema fingerprint, qualified by the connection when one is known.
    /// A changed or rediscovered schema therefore never serves runs cached against the old one.
    fn cache_scope(&self, schema: &DatabaseSchema) -> String {
        if self.connection_params.is_empty() {
            schema.schema_hash()
        } else {
            format!("{}:{}", connection_hash(&self.connection_params), schema.schema_hash())
        }
    }

    /// Transport errors become failed results so they land in the run record.
    async fn execute(executor: &dyn QueryExecutor, query: &str) -> QueryResult {
        let started = Instant::now();
        executor.execute(query).await.unwrap_or_else(|e| {
            warn!("{} execution failed: {}", executor.language(), e);
            QueryResult::failed(executor.name(), e.to_string(), started.elapsed().as_millis() as u64)
        })
    }

    pub async fn run(&self, question: &str, options: RunOptions) -> PipelineRun {
        let started = Instant::now();
        let mode = options.mode;
        let mut run = PipelineRun::new(question, mode);
        info!("Starting run {} ({} mode): {}", run.execution_id, mode, question);

        let stage = Instant::now();
        let schema = match self.schema(false).await {
            Ok(schema) => Some(schema),
            Err(e) => {
                run.fail(format!("Schema loading failed: {}", e));
                None
            }
        };
        run.time("schema", stage);

        let cache = match &schema {
            Some(schema) if options.use_cache && options.execute => {
                self.query_cache().map(|cache| (cache, self.cache_scope(schema)))
            }
            _ => None,
        };
        if let Some((cache, scope)) = &cache {
            if let Some(value) = cache.get(question, mode.as_str(), Some(scope.as_str())) {
                match serde_json::from_value::<PipelineRun>(value) {
                    Ok(cached) => {
                        info!("Returning cached result for run {}", cached.execution_id);
                        return cached;
                    }
                    Err(e) => warn!("Ignoring unreadable cached run: {}", e),
                }
            }
        }

        let stage = Instant::now();
        let intent = match self.generator.extract_intent(question).await {
            Ok(intent) => intent,
            Err(e) => {
                run.fail(format!("Intent extraction failed: {}", e));
                Intent::from_question(question)
            }
        };
        run.time("intent", stage);
        run.intent = Some(intent.clone());

        if let Some(schema) = &schema {
            if mode.wants_sql() {
                let stage = Instant::now();
                match self.generator.generate_sql(question, &intent, schema).await {
                    Ok(generated) => {
                        if !generated.is_valid() {
                            run.fail(format!("SQL validation failed: {}", generated.validation_errors().join("; ")));
                        }
                        run.sql = Some(generated);
                    }
                    Err(e) => run.fail(format!("SQL generation failed: {}", e)),
                }
                run.time("sql_generation", stage);
            }
            if mode.wants_dax() {
                let stage = Instant::now();
                match self.generator.generate_dax(question, &intent, schema).await {
                    Ok(generated) => {
                        if !generated.is_valid() {
                            run.fail(format!("DAX validation failed: {}", generated.validation_errors().join("; ")));
                        }
                        run.dax = Some(generated);
                    }
                    Err(e) => run.fail(format!("DAX generation failed: {}", e)),
                }
                run.time("dax_generation", stage);
            }
        }

        // Queries that failed validation never reach an executor.
        if options.execute {
            if let Some(sql) = run.sql.as_ref().filter(|g| g.is_valid()).map(|g| g.query.clone()) {
                match self.sql_executor.as_deref() {
                    Some(executor) => {
                        let stage = Instant::now();
                        let result = Self::execute(executor, &sql).await;
                        if let Some(err) = &result.error {
                            run.fail(format!("SQL execution failed: {}", err));
                        }
                        run.sql_result = Some(result);
                        run.time("sql_execution", stage);
                    }
                    None => run.warnings.push("SQL execution skipped: no SQL connection configured".to_string()),
                }
            }

            let dax = run.dax.as_ref().filter(|g| g.is_valid()).map(|g| g.query.clone());
            if let (Some(dax), Some(schema)) = (dax, &schema) {
                match self.dax_executor(schema) {
                    Some(executor) => {
                        let stage = Instant::now();
                        let result = Self::execute(executor.as_ref(), &dax).await;
                        if let Some(err) = &result.error {
                            run.fail(format!("DAX execution failed: {}", err));
                        }
                        run.dax_result = Some(result);
                        run.time("dax_execution", stage);
                    }
                    None => run.warnings.push("DAX execution skipped: no DAX executor configured".to_string()),
                }
            }
        }

        if self.settings.compare_results {
            let stage = Instant::now();
            let comparison = match (&run.sql_result, &run.dax_result) {
                (Some(sql), Some(dax)) if sql.success && dax.success => Some(compare_results(sql, dax)),
                _ => None,
            };
            if let Some(comparison) = comparison {
                info!("Comparison: {}", comparison.summary);
                run.comparison = Some(comparison);
                run.time("comparison", stage);
            }
        }

        run.success = run.errors.is_empty();
        run.time("total", started);

        if let Some((cache, scope)) = &cache {
            if run.success {
                if let Err(e) = cache.set(question, mode.as_str(), &run, None, Some(scope.as_str())) {
                    warn!("Failed to cache run: {}", e);
                }
            }
        }

        if self.settings.save_results {
            match self.save_run(&run) {
                Ok(path) => run.output_file = Some(path),
                Err(e) => warn!("Failed to save run record: {}", e),
            }
        }

        info!(
            "Run {} finished in {:.2}s with {} error(s)",
            run.execution_id,
            run.total_seconds(),
            run.errors.len()
        );
        run
    }

    fn save_run(&self, run: &PipelineRun) -> Result<PathBuf> {
        fs::create_dir_all(&self.settings.results_dir)?;
        let path = self
            .settings
            .results_dir
            .join(format!("pipeline_results_{}.json", run.execution_id));
        fs::write(&path, serde_json::to_string_pretty(run)?)?;
        info!("Run record saved to {}", path.display());
        Ok(path)
    }

    /// Probe every configured component without generating queries.
    pub async fn validate_configuration(&self) -> ConfigurationStatus {
        let mut status = ConfigurationStatus::default();

        match &self.sql_executor {
            Some(executor) => match executor.health_check().await {
                Ok(true) => status.sql_connection = true,
                Ok(false) => status.messages.push("SQL health check query returned no rows".to_string()),
                Err(e) => status.messages.push(format!("SQL connection failed: {}", e)),
            },
            None => status.messages.push("Azure SQL is not configured".to_string()),
        }

        match self.generator.llm().test_connection().await {
            Ok(_) => status.llm_connection = true,
            Err(e) => status.messages.push(format!("LLM connection failed: {}", e)),
        }

        match self.schema(false).await {
            Ok(schema) => {
                status.schema_access = true;
                let dax = self.dax_executor(&schema);
                status.dax_executor = dax.as_ref().map(|e| e.name().to_string());
                if let Some(executor) = dax.filter(|e| e.language() == QueryLanguage::Dax) {
                    if let Err(e) = executor.health_check().await {
                        status.messages.push(format!("DAX executor {} failed: {}", executor.name(), e));
                    }
                }
            }
            Err(e) => status.messages.push(format!("Schema access failed: {}", e)),
        }

        if status.dax_executor.is_none() {
            status.messages.push("No DAX executor configured".to_string());
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::fixtures::banking_schema;
    use crate::schema::ColumnInfo;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct CannedModel;

    #[async_trait]
    impl LanguageModel for CannedModel {
        async fn complete(&self, system: &str, _user: &str) -> Result<String> {
            let reply = if system.contains("JSON") {
                "{\"intent\": \"segments\", \"entities\": [\"segment\"]}"
            } else if system.contains("T-SQL") {
                "SELECT DISTINCT [SEGMENT] FROM [dbo].[DIM_CUSTOMER]"
            } else {
                "EVALUATE SUMMARIZE('DIM_CUSTOMER', 'DIM_CUSTOMER'[SEGMENT])"
            };
            Ok(reply.to_string())
        }
    }

    /// Answers every generation prompt with a query the validators reject.
    struct RejectedModel;

    #[async_trait]
    impl LanguageModel for RejectedModel {
        async fn complete(&self, system: &str, _user: &str) -> Result<String> {
            let reply = if system.contains("JSON") {
                "{\"intent\": \"cleanup\"}"
            } else if system.contains("T-SQL") {
                "DELETE FROM DIM_CUSTOMER"
            } else {
                "EVALUATE 'NO_SUCH_TABLE'"
            };
            Ok(reply.to_string())
        }
    }

    #[derive(Default)]
    struct SegmentsExecutor {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QueryExecutor for SegmentsExecutor {
        fn name(&self) -> &'static str {
            "segments"
        }

        fn language(&self) -> QueryLanguage {
            QueryLanguage::Sql
        }

        async fn execute(&self, query: &str) -> Result<QueryResult> {
            self.queries.lock().unwrap().push(query.to_string());
            let rows = vec![
                json!({"SEGMENT": "Retail"}).as_object().unwrap().clone(),
                json!({"SEGMENT": "Corporate"}).as_object().unwrap().clone(),
            ];
            Ok(QueryResult::ok("segments", Vec::new(), rows, 4))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn settings(dir: &tempfile::TempDir) -> PipelineSettings {
        PipelineSettings {
            cache_dir: dir.path().join("cache"),
            results_dir: dir.path().join("results"),
            ..Default::default()
        }
    }

    fn params() -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("database".to_string(), "banking".to_string());
        params
    }

    #[test]
    fn test_execution_id_format() {
        let id = new_execution_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "run");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
    }

    #[tokio::test]
    async fn test_both_modes_compare_through_translated_dax() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(SegmentsExecutor::default());
        let pipeline = Nl2DaxPipeline::new(CannedModel, settings(&dir))
            .with_sql_executor(executor.clone(), params())
            .with_schema(banking_schema());

        let run = pipeline.run("list segments", RunOptions::default()).await;
        assert!(run.success, "{:?}", run.errors);
        assert_eq!(run.intent.as_ref().unwrap().intent, "segments");
        assert_eq!(run.dax_result.as_ref().unwrap().engine, "dax-via-sql (segments)");
        assert!(run.comparison.as_ref().unwrap().matches);
        assert!(run.output_file.as_ref().unwrap().exists());
        for stage in ["schema", "intent", "sql_generation", "dax_generation", "sql_execution", "dax_execution", "comparison", "total"] {
            assert!(run.timings.contains_key(stage), "missing timing {}", stage);
        }

        let cached = pipeline.run("List   segments", RunOptions::default()).await;
        assert!(cached.from_cache);
        assert!(cached.cache_timestamp.is_some());
        assert_eq!(cached.execution_id, run.execution_id);
        assert_eq!(executor.queries.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_execute_and_missing_schema() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Nl2DaxPipeline::new(CannedModel, settings(&dir)).with_schema(banking_schema());
        let options = RunOptions {
            mode: PipelineMode::Sql,
            execute: false,
            use_cache: true,
        };
        let run = pipeline.run("list segments", options).await;
        assert!(run.success);
        assert!(run.sql.is_some());
        assert!(run.dax.is_none());
        assert!(run.sql_result.is_none());

        let bare = Nl2DaxPipeline::new(CannedModel, settings(&dir));
        let run = bare.run("list segments", RunOptions::default()).await;
        assert!(!run.success);
        assert!(run.errors[0].starts_with("Schema loading failed"));
        // intent still runs without a schema
        assert!(run.intent.is_some());
    }

    #[tokio::test]
    async fn test_configuration_status() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Nl2DaxPipeline::new(CannedModel, settings(&dir))
            .with_sql_executor(Arc::new(SegmentsExecutor::default()), params())
            .with_schema(banking_schema());
        let status = pipeline.validate_configuration().await;
        assert!(status.sql_connection && status.llm_connection && status.schema_access);
        assert_eq!(status.dax_executor.as_deref(), Some("dax-via-sql"));
        assert!(status.is_ready());
    }

    #[tokio::test]
    async fn test_rejected_queries_never_execute() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(SegmentsExecutor::default());
        let pipeline = Nl2DaxPipeline::new(RejectedModel, settings(&dir))
            .with_sql_executor(executor.clone(), params())
            .with_schema(banking_schema());

        let run = pipeline.run("purge stale records", RunOptions::default()).await;
        assert!(!run.success);
        assert!(
            run.errors
                .iter()
                .any(|e| e.starts_with("SQL validation failed: DELETE statements are not allowed")),
            "{:?}",
            run.errors
        );
        assert!(
            run.errors
                .iter()
                .any(|e| e.starts_with("DAX validation failed: Table 'NO_SUCH_TABLE' not found")),
            "{:?}",
            run.errors
        );
        assert!(run.sql.is_some() && run.dax.is_some());
        assert!(run.sql_result.is_none());
        assert!(run.dax_result.is_none());
        assert!(executor.queries.lock().unwrap().is_empty());

        // failed runs are not cached
        let again = pipeline.run("purge stale records", RunOptions::default()).await;
        assert!(!again.from_cache);
        assert!(executor.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schema_change_misses_query_cache() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(SegmentsExecutor::default());
        let options = RunOptions {
            mode: PipelineMode::Sql,
            ..Default::default()
        };

        let pipeline = Nl2DaxPipeline::new(CannedModel, settings(&dir))
            .with_sql_executor(executor.clone(), params())
            .with_schema(banking_schema());
        let first = pipeline.run("list segments", options).await;
        assert!(first.success, "{:?}", first.errors);
        assert!(pipeline.run("list segments", options).await.from_cache);
        assert_eq!(executor.queries.lock().unwrap().len(), 1);

        let mut changed = banking_schema();
        changed.tables[0].columns.push(ColumnInfo::new("REGION", "varchar"));
        let pipeline = pipeline.with_schema(changed);

        let rerun = pipeline.run("list segments", options).await;
        assert!(rerun.success, "{:?}", rerun.errors);
        assert!(!rerun.from_cache);
        assert_ne!(rerun.execution_id, first.execution_id);
        assert_eq!(executor.queries.lock().unwrap().len(), 2);
    }
}
