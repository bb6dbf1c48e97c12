//! DAX executor that runs translated DAX on a SQL backend.

use crate::dax::translate_dax_to_sql;
use crate::error::Result;
use crate::execution::engine::{QueryExecutor, QueryLanguage};
use crate::execution::result::QueryResult;
use crate::schema::DatabaseSchema;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct SqlBackedDaxExecutor {
    inner: Arc<dyn QueryExecutor>,
    schema: Arc<DatabaseSchema>,
}

impl SqlBackedDaxExecutor {
    pub fn new(inner: Arc<dyn QueryExecutor>, schema: Arc<DatabaseSchema>) -> Self {
        Self { inner, schema }
    }
}

#[async_trait]
impl QueryExecutor for SqlBackedDaxExecutor {
    fn name(&self) -> &'static str {
        "dax-via-sql"
    }

    fn language(&self) -> QueryLanguage {
        QueryLanguage::Dax
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        let sql = translate_dax_to_sql(query, &self.schema)?;
        debug!("Translated DAX to SQL: {}", sql);
        let mut result = self.inner.execute(&sql).await?;
        result.engine = format!("{} ({})", self.name(), self.inner.name());
        Ok(result.with_warning(format!("Translated SQL: {}", sql)))
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }
}
