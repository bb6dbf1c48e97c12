use async_trait::async_trait;
use nl2dax::config::{LlmProvider, LlmSettings, PipelineSettings};
use nl2dax::execution::{QueryExecutor, QueryLanguage, QueryResult, Row};
use nl2dax::llm::LlmClient;
use nl2dax::pipeline::load_schema;
use nl2dax::schema::TableKind;
use nl2dax::{Nl2DaxPipeline, PipelineMode, Result, RunOptions};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rows(value: Value) -> Vec<Row> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|r| r.as_object().cloned()).collect())
        .unwrap_or_default()
}

/// Small warehouse answering catalog queries and any data query with customer segments.
#[derive(Default)]
struct Warehouse {
    queries: Mutex<Vec<String>>,
}

impl Warehouse {
    fn data_queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| !q.contains("INFORMATION_SCHEMA") && !q.starts_with("SELECT TOP 3 *"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl QueryExecutor for Warehouse {
    fn name(&self) -> &'static str {
        "warehouse"
    }

    fn language(&self) -> QueryLanguage {
        QueryLanguage::Sql
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        self.queries.lock().unwrap().push(query.to_string());
        let data = if query.contains("REFERENTIAL_CONSTRAINTS") {
            json!([{"FROM_TABLE": "FACT_LOAN", "FROM_COLUMN": "CUSTOMER_KEY", "TO_TABLE": "CUSTOMER_DIMENSION", "TO_COLUMN": "CUSTOMER_KEY"}])
        } else if query.contains("TABLE_CONSTRAINTS") {
            json!([
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "COLUMN_NAME": "CUSTOMER_KEY"},
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "COLUMN_NAME": "LOAN_ID"}
            ])
        } else if query.contains("INFORMATION_SCHEMA.COLUMNS") {
            json!([
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "COLUMN_NAME": "CUSTOMER_KEY", "DATA_TYPE": "int", "IS_NULLABLE": "NO"},
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "COLUMN_NAME": "CUSTOMER_NAME", "DATA_TYPE": "nvarchar", "CHARACTER_MAXIMUM_LENGTH": 100, "IS_NULLABLE": "YES"},
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "COLUMN_NAME": "SEGMENT", "DATA_TYPE": "nvarchar", "CHARACTER_MAXIMUM_LENGTH": 20, "IS_NULLABLE": "YES"},
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "COLUMN_NAME": "LOAN_ID", "DATA_TYPE": "int", "IS_NULLABLE": "NO"},
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "COLUMN_NAME": "CUSTOMER_KEY", "DATA_TYPE": "int", "IS_NULLABLE": "NO"},
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "COLUMN_NAME": "PRINCIPAL_AMOUNT", "DATA_TYPE": "decimal", "IS_NULLABLE": "YES"}
            ])
        } else if query.contains("INFORMATION_SCHEMA.TABLES") {
            json!([
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "CUSTOMER_DIMENSION", "TABLE_TYPE": "BASE TABLE"},
                {"TABLE_SCHEMA": "dbo", "TABLE_NAME": "FACT_LOAN", "TABLE_TYPE": "BASE TABLE"}
            ])
        } else if query.starts_with("SELECT TOP 3 *") {
            json!([])
        } else {
            json!([{"SEGMENT": "Retail"}, {"SEGMENT": "Corporate"}])
        };
        Ok(QueryResult::ok(self.name(), Vec::new(), rows(data), 2))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

fn chat_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    }))
}

async fn mount_reply(server: &MockServer, marker: &str, content: &str) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains(marker))
        .respond_with(chat_reply(content))
        .expect(1)
        .mount(server)
        .await;
}

fn llm(server: &MockServer) -> LlmClient {
    LlmClient::new(LlmSettings {
        api_key: "sk-test".to_string(),
        provider: LlmProvider::OpenAi {
            base_url: server.uri(),
            model: "gpt-4".to_string(),
        },
    })
    .unwrap()
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
    params.insert("server".to_string(), "warehouse.local".to_string());
    params.insert("database".to_string(), "banking".to_string());
    params
}

#[tokio::test]
async fn test_question_to_compared_results() {
    let server = MockServer::start().await;
    mount_reply(&server, "JSON:", "{\"intent\": \"list segments\", \"group_by\": [\"SEGMENT\"]}").await;
    mount_reply(
        &server,
        "SQL Query:",
        "```sql\nSELECT DISTINCT [SEGMENT] FROM [dbo].[CUSTOMER_DIMENSION]\n```",
    )
    .await;
    mount_reply(
        &server,
        "DAX Query:",
        "Here you go:\n```dax\nEVALUATE SUMMARIZE('CUSTOMER_DIMENSION', 'CUSTOMER_DIMENSION'[SEGMENT])\n```",
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let warehouse = Arc::new(Warehouse::default());
    let pipeline = Nl2DaxPipeline::new(llm(&server), settings(&dir)).with_sql_executor(warehouse.clone(), params());

    let run = pipeline.run("Which segments do we serve?", RunOptions::default()).await;
    assert!(run.success, "{:?}", run.errors);
    assert!(run.execution_id.starts_with("run_"));

    let sql = run.sql.as_ref().unwrap();
    assert_eq!(sql.query, "SELECT DISTINCT [SEGMENT] FROM [dbo].[CUSTOMER_DIMENSION];");
    let dax = run.dax.as_ref().unwrap();
    assert_eq!(dax.query, "EVALUATE SUMMARIZE('CUSTOMER_DIMENSION', 'CUSTOMER_DIMENSION'[SEGMENT])");
    assert!(dax.dax_validation.as_ref().unwrap().is_valid);

    let dax_result = run.dax_result.as_ref().unwrap();
    assert_eq!(dax_result.engine, "dax-via-sql (warehouse)");
    assert!(run.comparison.as_ref().unwrap().matches);
    assert_eq!(warehouse.data_queries().len(), 2);

    let record: Value =
        serde_json::from_str(&std::fs::read_to_string(run.output_file.as_ref().unwrap()).unwrap()).unwrap();
    assert_eq!(record["execution_id"], json!(run.execution_id));
    assert_eq!(record["mode"], json!("both"));

    // second ask is served from the query cache: no model calls, no queries
    let cached = pipeline.run("which segments do we  serve?", RunOptions::default()).await;
    assert!(cached.from_cache);
    assert_eq!(warehouse.data_queries().len(), 2);

    // the discovered schema was cached for this connection
    let schema = load_schema(&settings(&dir), None, &params(), false).await.unwrap();
    assert_eq!(schema.database, "banking");
    assert_eq!(schema.table("FACT_LOAN").unwrap().kind, TableKind::Fact);
    assert_eq!(schema.relationships.len(), 1);
}

#[tokio::test]
async fn test_model_failure_is_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": {"message": "model overloaded"}})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let warehouse = Arc::new(Warehouse::default());
    let pipeline = Nl2DaxPipeline::new(llm(&server), settings(&dir)).with_sql_executor(warehouse.clone(), params());
    let options = RunOptions {
        mode: PipelineMode::Sql,
        ..Default::default()
    };

    let run = pipeline.run("Which segments do we serve?", options).await;
    assert!(!run.success);
    assert_eq!(
        run.errors,
        vec![
            "Intent extraction failed: LLM error: HTTP 500: model overloaded",
            "SQL generation failed: LLM error: HTTP 500: model overloaded",
        ]
    );
    // heuristic intent stands in for the model's
    assert_eq!(run.intent.as_ref().unwrap().intent, "Which segments do we serve?");
    assert!(run.sql_result.is_none());
    assert!(warehouse.data_queries().is_empty());

    let again = pipeline.run("Which segments do we serve?", options).await;
    assert!(!again.from_cache);
}
