pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;

pub use config::{AnalysisOptions, Linkage};
pub use engine::AnalysisEngine;
pub use error::{EngineError, ErrorType};
pub use models::{AbortResult, AnalysisResult, BatchResult, SystemStatus};
pub use services::ingest::{ProgressStage, ProgressUpdate};
