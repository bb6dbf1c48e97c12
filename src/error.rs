use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Power BI error: {message}")]
    PowerBi { message: String, status: Option<u16> },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("DAX translation error: {0}")]
    Translation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl PipelineError {
    pub fn power_bi(message: impl Into<String>, status: Option<u16>) -> Self {
        PipelineError::PowerBi {
            message: message.into(),
            status,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::PowerBi { status, .. } => crate::execution::retry::is_transient_status(*status),
            _ => false,
        }
    }
}

impl From<polars::prelude::PolarsError> for PipelineError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        PipelineError::Polars(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
