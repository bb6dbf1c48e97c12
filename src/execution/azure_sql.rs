//! Azure SQL executor over TDS (tiberius).

use crate::config::AzureSqlSettings;
use crate::error::{PipelineError, Result};
use crate::execution::engine::{QueryExecutor, QueryLanguage};
use crate::execution::result::{QueryResult, Row};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

type SqlClient = Client<Compat<TcpStream>>;

pub struct AzureSqlExecutor {
    settings: AzureSqlSettings,
    client: Mutex<Option<SqlClient>>,
}

impl AzureSqlExecutor {
    pub fn new(settings: AzureSqlSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.settings.server);
        config.port(self.settings.port);
        config.database(&self.settings.database);
        config.authentication(AuthMethod::sql_server(&self.settings.username, &self.settings.password));
        config.encryption(EncryptionLevel::Required);
        if self.settings.trust_cert {
            config.trust_cert();
        }
        config
    }

    async fn connect(&self) -> Result<SqlClient> {
        let config = self.config();
        info!(
            "Connecting to Azure SQL {}:{} / {}",
            self.settings.server, self.settings.port, self.settings.database
        );

        match Client::connect(config.clone(), open_tcp(&config).await?.compat_write()).await {
            Ok(client) => Ok(client),
            // Azure SQL gateways may redirect the session to a worker node.
            Err(tiberius::error::Error::Routing { host, port }) => {
                debug!("Redirected to {}:{}", host, port);
                let mut config = config;
                config.host(&host);
                config.port(port);
                let tcp = open_tcp(&config).await?;
                Client::connect(config, tcp.compat_write())
                    .await
                    .map_err(|e| PipelineError::Execution(format!("Azure SQL login failed: {}", e)))
            }
            Err(e) => Err(PipelineError::Execution(format!("Azure SQL login failed: {}", e))),
        }
    }

    async fn run(&self, client: &mut SqlClient, query: &str) -> std::result::Result<(Vec<String>, Vec<Row>), tiberius::error::Error> {
        let mut stream = client.simple_query(query).await?;
        let mut columns: Vec<String> = stream
            .columns()
            .await?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = stream.into_first_result().await?;
        if columns.is_empty() {
            if let Some(first) = rows.first() {
                columns = first.columns().iter().map(|c| c.name().to_string()).collect();
            }
        }

        let rows = rows
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.into_iter().map(|cell| cell_to_json(&cell)))
                    .collect::<Row>()
            })
            .collect();
        Ok((columns, rows))
    }
}

async fn open_tcp(config: &Config) -> Result<TcpStream> {
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| PipelineError::Execution(format!("Cannot reach Azure SQL: {}", e)))?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

#[async_trait]
impl QueryExecutor for AzureSqlExecutor {
    fn name(&self) -> &'static str {
        "azure-sql"
    }

    fn language(&self) -> QueryLanguage {
        QueryLanguage::Sql
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        let start = Instant::now();
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let client = guard
            .as_mut()
            .ok_or_else(|| PipelineError::Execution("Azure SQL connection unavailable".to_string()))?;

        match self.run(client, query).await {
            Ok((columns, rows)) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!("Azure SQL returned {} rows in {} ms", rows.len(), elapsed);
                Ok(QueryResult::ok(self.name(), columns, rows, elapsed))
            }
            Err(e) => {
                // Drop the session; the next call reconnects.
                *guard = None;
                warn!("Azure SQL query failed: {}", e);
                Err(PipelineError::Execution(format!("Azure SQL query failed: {}", e)))
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let result = self.execute("SELECT 1 AS test").await?;
        Ok(result.success && result.row_count == 1)
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn cell_to_json(cell: &ColumnData<'static>) -> Value {
    match cell {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|f| number(f as f64)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(number).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v
            .as_ref()
            .map(|g| Value::String(g.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| number(n.value() as f64 / 10f64.powi(n.scale() as i32)))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(hex::encode(b.as_ref())))
            .unwrap_or(Value::Null),
        other => temporal_to_json(other),
    }
}

fn temporal_to_json(cell: &ColumnData<'static>) -> Value {
    if let Ok(Some(dt)) = chrono::DateTime::<chrono::FixedOffset>::from_sql(cell) {
        return Value::String(dt.to_rfc3339());
    }
    if let Ok(Some(dt)) = chrono::NaiveDateTime::from_sql(cell) {
        return Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = chrono::NaiveDate::from_sql(cell) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(t)) = chrono::NaiveTime::from_sql(cell) {
        return Value::String(t.format("%H:%M:%S%.f").to_string());
    }
    Value::Null
}
