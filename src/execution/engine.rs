//! Executor trait - core contract for every query backend.
//!
//! SQL backends (Azure SQL) and DAX backends (Power BI REST, XMLA, or DAX
//! translated onto SQL) share this interface so the pipeline can run either
//! language without knowing the transport.

use crate::error::Result;
use crate::execution::result::QueryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLanguage {
    Sql,
    Dax,
}

impl fmt::Display for QueryLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryLanguage::Sql => write!(f, "SQL"),
            QueryLanguage::Dax => write!(f, "DAX"),
        }
    }
}

/// Query executor trait - all backends implement this
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Executor name (e.g., "azure-sql", "powerbi-rest")
    fn name(&self) -> &'static str;

    /// Language accepted by [`QueryExecutor::execute`]
    fn language(&self) -> QueryLanguage;

    /// Execute a query. Transport and server failures are `Err`.
    async fn execute(&self, query: &str) -> Result<QueryResult>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> Result<bool>;
}
