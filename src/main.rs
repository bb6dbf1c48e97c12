use nl2dax::cache::{QueryCache, SchemaCache};
use nl2dax::compare::comparison_report;
use nl2dax::config::Section;
use nl2dax::dax::{format_local, suggest_improvements, DaxFormatterClient, DaxValidator, PatternPlanner};
use nl2dax::execution::{AzureSqlExecutor, QueryExecutor, QueryResult};
use nl2dax::generator::GeneratedQuery;
use nl2dax::pipeline::load_schema;
use nl2dax::schema::DatabaseSchema;
use nl2dax::{Nl2DaxPipeline, PipelineConfig, PipelineMode, PipelineRun, RunOptions};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PREVIEW_ROWS: usize = 20;

#[derive(Parser)]
#[command(name = "nl2dax")]
#[command(about = "Natural language to SQL and DAX over Azure SQL and Power BI")]
#[command(version)]
struct Args {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a business question with generated SQL and/or DAX
    Ask {
        /// The question; read from stdin when omitted
        question: Option<String>,

        #[arg(long, value_enum, default_value_t = PipelineMode::Both)]
        mode: PipelineMode,

        /// Generate queries without running them
        #[arg(long)]
        no_execute: bool,

        /// Skip the query cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Write result tables as CSV into this directory
        #[arg(long)]
        export_csv: Option<PathBuf>,
    },
    /// Validate a DAX query against the schema
    ValidateDax {
        /// File containing the query
        file: Option<PathBuf>,

        #[arg(short, long)]
        query: Option<String>,
    },
    /// Build DAX for a question from templates, without the language model
    PlanDax {
        question: String,

        /// Print the whole plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Format a DAX query
    FormatDax {
        /// File containing the query
        file: Option<PathBuf>,

        #[arg(short, long)]
        query: Option<String>,

        /// Use the DAX Formatter web service instead of the local formatter
        #[arg(long)]
        remote: bool,
    },
    /// Show the discovered schema
    Schema {
        /// Rediscover instead of reading the cache
        #[arg(long)]
        refresh: bool,
    },
    /// Inspect or clear the caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Check configuration and connectivity
    Check,
}

#[derive(Subcommand)]
enum CacheAction {
    Info,
    Clear,
    /// Remove expired query cache entries
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = PipelineConfig::from_env();

    match args.command {
        Commands::Ask {
            question,
            mode,
            no_execute,
            no_cache,
            export_csv,
        } => {
            let options = RunOptions {
                mode,
                execute: !no_execute,
                use_cache: !no_cache,
            };
            ask(&config, question, options, export_csv).await
        }
        Commands::ValidateDax { file, query } => validate_dax(&config, read_query(file, query)?).await,
        Commands::PlanDax { question, json } => plan_dax(&config, &question, json).await,
        Commands::FormatDax { file, query, remote } => format_dax(read_query(file, query)?, remote).await,
        Commands::Schema { refresh } => show_schema(&config, refresh).await,
        Commands::Cache { action } => cache(&config, action),
        Commands::Check => check(&config).await,
    }
}

fn banner(title: &str) {
    println!("\n{}", "=".repeat(80));
    println!(" {}", title);
    println!("{}", "=".repeat(80));
}

/// Query text from `--query`, a file, or stdin, in that order.
fn read_query(file: Option<PathBuf>, query: Option<String>) -> Result<String> {
    let text = match (query, file) {
        (Some(query), _) => query,
        (None, Some(path)) => fs::read_to_string(&path).with_context(|| format!("Cannot read {}", path.display()))?,
        (None, None) => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            text
        }
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(anyhow!("No query given"));
    }
    Ok(text)
}

fn sql_executor(config: &PipelineConfig) -> Option<AzureSqlExecutor> {
    config.sql.clone().map(AzureSqlExecutor::new)
}

fn connection_params(config: &PipelineConfig) -> BTreeMap<String, String> {
    config.sql.as_ref().map(|s| s.connection_params()).unwrap_or_default()
}

async fn schema_for(config: &PipelineConfig, refresh: bool) -> Result<DatabaseSchema> {
    let executor = sql_executor(config);
    let schema = load_schema(
        &config.pipeline,
        executor.as_ref().map(|e| e as &dyn QueryExecutor),
        &connection_params(config),
        refresh,
    )
    .await?;
    Ok(schema)
}

async fn ask(config: &PipelineConfig, question: Option<String>, options: RunOptions, export_csv: Option<PathBuf>) -> Result<()> {
    let question = match question {
        Some(q) => q,
        None => {
            print!("Question: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if question.is_empty() {
        return Err(anyhow!("No question given"));
    }

    let pipeline = Nl2DaxPipeline::from_config(config)?;
    let run = pipeline.run(&question, options).await;
    print_run(&run);

    if let Some(dir) = export_csv {
        export(&run, &dir)?;
    }
    if run.success {
        Ok(())
    } else {
        Err(anyhow!("Run {} finished with {} error(s)", run.execution_id, run.errors.len()))
    }
}

fn print_generated(title: &str, generated: &GeneratedQuery) {
    println!("\n {}:", title);
    println!("{}", generated.query);
    for correction in &generated.corrections {
        println!("   correction: {}", correction);
    }
    if let Some(validation) = &generated.sql_validation {
        for error in &validation.errors {
            println!("   error: {}", error);
        }
        for warning in &validation.warnings {
            println!("   warning: {}", warning);
        }
    }
    if let Some(validation) = &generated.dax_validation {
        for issue in &validation.issues {
            println!("   {}", issue);
        }
    }
}

fn print_result(title: &str, result: &QueryResult) {
    println!("\n {} ({}, {} ms):", title, result.engine, result.execution_time_ms);
    if let Some(error) = &result.error {
        println!("   failed: {}", error);
        return;
    }
    match result.to_dataframe() {
        Ok(df) => {
            println!("{}", df.head(Some(PREVIEW_ROWS)));
            if result.row_count > PREVIEW_ROWS {
                println!("   ... {} rows in total", result.row_count);
            }
        }
        Err(e) => println!("   {} rows (table unavailable: {})", result.row_count, e),
    }
    for warning in &result.warnings {
        println!("   note: {}", warning);
    }
}

fn print_run(run: &PipelineRun) {
    banner(&format!("RUN {}", run.execution_id));
    println!("\n Question: {}", run.question);
    if run.from_cache {
        println!(
            " (from cache, stored {})",
            run.cache_timestamp.as_deref().unwrap_or("at an unknown time")
        );
    }
    if let Some(intent) = &run.intent {
        println!("\n Intent:");
        print!("{}", intent.prompt_block());
    }
    if let Some(sql) = &run.sql {
        print_generated("SQL", sql);
    }
    if let Some(dax) = &run.dax {
        print_generated("DAX", dax);
    }
    if let Some(result) = &run.sql_result {
        print_result("SQL result", result);
    }
    if let Some(result) = &run.dax_result {
        print_result("DAX result", result);
    }
    if let (Some(comparison), Some(sql), Some(dax)) = (&run.comparison, &run.sql_result, &run.dax_result) {
        println!();
        print!("{}", comparison_report(comparison, sql, dax));
    }
    for warning in &run.warnings {
        println!("\n warning: {}", warning);
    }
    if !run.errors.is_empty() {
        println!("\n Errors:");
        for error in &run.errors {
            println!("   - {}", error);
        }
    }
    if let Some(path) = &run.output_file {
        println!("\n Run record: {}", path.display());
    }
    println!("\n Finished in {:.2}s", run.total_seconds());
}

fn export(run: &PipelineRun, dir: &Path) -> Result<()> {
    let results = [("sql", &run.sql_result), ("dax", &run.dax_result)];
    for (label, result) in results {
        if let Some(result) = result.as_ref().filter(|r| r.success) {
            let path = dir.join(format!("{}_{}.csv", run.execution_id, label));
            result.write_csv(&path)?;
            info!("Exported {} rows to {}", result.row_count, path.display());
            println!(" Exported {} result to {}", label.to_uppercase(), path.display());
        }
    }
    Ok(())
}

async fn validate_dax(config: &PipelineConfig, query: String) -> Result<()> {
    let schema = schema_for(config, false).await?;
    let validator = DaxValidator::new(&schema);
    let result = validator.validate(&query);

    banner("DAX VALIDATION");
    println!("\n Valid: {}", result.is_valid);
    for issue in &result.issues {
        println!(" {}", issue);
    }
    for hint in suggest_improvements(&query) {
        println!(" hint: {}", hint);
    }
    if let Some(corrected) = &result.corrected_query {
        println!("\n Corrected query:\n{}", corrected);
    }
    if !result.is_valid {
        println!("\n{}", validator.schema_summary());
        return Err(anyhow!("DAX query is invalid"));
    }
    Ok(())
}

async fn plan_dax(config: &PipelineConfig, question: &str, json: bool) -> Result<()> {
    let schema = schema_for(config, false).await?;
    let planner = PatternPlanner::new(&schema);
    let plan = planner.plan(question, None)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    banner("DAX PLAN");
    println!("\n Pattern: {}", plan.pattern);
    println!(" Primary table: {}", plan.primary_table);
    println!(" Confidence: {:.2}", plan.confidence);
    println!("\n{}", format_local(&plan.expression).0);
    for issue in &planner.validate_generated(&plan.expression).issues {
        println!(" {}", issue);
    }
    Ok(())
}

async fn format_dax(query: String, remote: bool) -> Result<()> {
    let (formatted, errors) = if remote {
        DaxFormatterClient::new()?.format(&query).await
    } else {
        format_local(&query)
    };
    println!("{}", formatted);
    for error in &errors {
        eprintln!("error: {}", error);
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} formatting error(s)", errors.len()))
    }
}

async fn show_schema(config: &PipelineConfig, refresh: bool) -> Result<()> {
    let schema = schema_for(config, refresh).await?;
    let summary = schema.summary();

    banner(&format!("SCHEMA {}", summary.database));
    println!("\n Tables: {} ({} schema)", summary.total_tables, summary.schema_type);
    println!(" Fact tables: {}", summary.fact_tables.join(", "));
    println!(" Dimension tables: {}", summary.dimension_tables.join(", "));
    println!(" Relationships: {}", summary.relationship_count);
    println!(" Fingerprint: {}", schema.schema_hash());
    println!();
    for table in &schema.tables {
        println!(" {} [{}] {} columns", table.full_name(), table.kind, table.columns.len());
    }
    Ok(())
}

fn cache(config: &PipelineConfig, action: CacheAction) -> Result<()> {
    let settings = &config.pipeline;
    let queries = QueryCache::new(settings.query_cache_dir(), settings.query_cache_ttl_secs)?;
    let schemas = SchemaCache::new(settings.schema_cache_dir())?;

    match action {
        CacheAction::Info => {
            let stats = queries.stats()?;
            banner("CACHE");
            println!("\n Query cache: {}", queries.dir().display());
            println!("   entries: {}", stats.entries);
            println!("   disk usage: {} bytes", stats.disk_usage_bytes);
            println!("\n Schema cache: {}", schemas.dir().display());
            for info in schemas.info()? {
                println!(
                    "   {} {} - {} tables, {} schema, {:.1}h old",
                    info.connection_hash, info.database, info.total_tables, info.schema_type, info.age_hours
                );
            }
        }
        CacheAction::Clear => {
            let removed_queries = queries.clear_all()?;
            let removed_schemas = schemas.clear(None)?;
            println!(
                "Removed {} query cache entries and {} cached schemas",
                removed_queries, removed_schemas
            );
        }
        CacheAction::Cleanup => {
            println!("Removed {} expired query cache entries", queries.cleanup_expired()?);
        }
    }
    Ok(())
}

async fn check(config: &PipelineConfig) -> Result<()> {
    banner("CONFIGURATION CHECK");
    for (section, label) in [
        (Section::Llm, "LLM"),
        (Section::AzureSql, "Azure SQL"),
        (Section::PowerBi, "Power BI"),
    ] {
        let missing = config.missing(&[section]);
        if missing.is_empty() {
            println!(" {}: configured", label);
        } else {
            println!(" {}: missing {}", label, missing.join(", "));
        }
    }

    let pipeline = Nl2DaxPipeline::from_config(config)?;
    let status = pipeline.validate_configuration().await;
    println!("\n SQL connection: {}", status.sql_connection);
    println!(" LLM connection: {}", status.llm_connection);
    println!(" Schema access: {}", status.schema_access);
    println!(" DAX executor: {}", status.dax_executor.as_deref().unwrap_or("none"));
    for message in &status.messages {
        println!("   - {}", message);
    }

    if status.is_ready() {
        println!("\n Ready.");
        Ok(())
    } else {
        Err(anyhow!("Configuration is incomplete"))
    }
}
