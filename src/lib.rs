pub mod cache;
pub mod compare;
pub mod config;
pub mod dax;
pub mod error;
pub mod execution;
pub mod extract;
pub mod generator;
pub mod intent;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod sql_check;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Nl2DaxPipeline, PipelineMode, PipelineRun, RunOptions};
