//! Query execution backends
//!
//! One executor per transport: Azure SQL for T-SQL, Power BI REST or XMLA for
//! DAX, and a SQL-backed DAX executor for setups without a Power BI dataset.

pub mod azure_sql;
pub mod engine;
pub mod powerbi;
pub mod result;
pub mod retry;
pub mod translated;
pub mod xmla;

pub use azure_sql::AzureSqlExecutor;
pub use engine::{QueryExecutor, QueryLanguage};
pub use powerbi::{AzureAdTokenProvider, PowerBiRestExecutor};
pub use result::{QueryResult, Row};
pub use retry::{hint_for_status, is_transient_status, retry_with_backoff, RetryPolicy};
pub use translated::SqlBackedDaxExecutor;
pub use xmla::XmlaExecutor;

use crate::config::PowerBiSettings;
use crate::error::Result;
use std::sync::Arc;

/// Pick the DAX transport from the endpoint scheme: `powerbi://` uses the REST
/// executeQueries API, anything else is treated as an XMLA HTTP endpoint.
pub fn dax_executor_for(settings: &PowerBiSettings, retry: RetryPolicy) -> Result<Arc<dyn QueryExecutor>> {
    if settings.endpoint.trim().to_lowercase().starts_with("powerbi://") {
        Ok(Arc::new(PowerBiRestExecutor::new(settings, retry)?))
    } else {
        Ok(Arc::new(XmlaExecutor::new(settings, retry)?))
    }
}
