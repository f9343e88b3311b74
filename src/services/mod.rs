pub mod aggregator;
pub mod cache;
pub mod excel;
pub mod ingest;
pub mod stats;
pub mod strategy;
pub mod validator;
pub mod worker_pool;
