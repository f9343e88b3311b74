pub mod analyzer;
pub mod binary;
pub mod container;
pub mod metadata;
pub mod parser;
pub mod structured;
pub mod types;
pub mod utils;

pub use analyzer::SheetAnalyzer;
pub use parser::TieredParser;
