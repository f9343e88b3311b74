use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use crate::error::EngineError;

const MIB: u64 = 1024 * 1024;

fn default_max_file_size() -> u64 {
    // 500 MB in bytes
    500 * MIB
}

fn default_max_rows_per_sheet() -> usize {
    1_000_000
}

fn default_max_sheets() -> usize {
    50
}

fn default_worker_count() -> usize {
    4
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_cache_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Linkage criterion for agglomerative clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    Single,
    Complete,
    Average,
}

/// Per-call analysis options. Unknown keys are rejected when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct AnalysisOptions {
    pub max_file_size: u64,
    pub max_rows_per_sheet: usize,
    pub max_sheets: usize,
    pub enable_streaming: bool,
    pub enable_workers: bool,
    pub worker_count: usize,
    pub chunk_size: usize,
    /// Per-task worker timeout in milliseconds.
    pub timeout: u64,
    pub enable_cache: bool,
    pub cache_size: usize,
    pub precision_mode: bool,
    pub force_headers: bool,
    pub enable_advanced_analysis: bool,
    #[serde(rename = "enableML")]
    pub enable_ml: bool,
    pub enable_time_series: bool,
    pub enable_clustering: bool,
    pub force_streaming: bool,
    pub force_parallel: bool,

    pub correlation_threshold: f64,
    pub min_support: f64,
    pub max_clusters: usize,
    pub dbscan_min_pts: usize,
    pub linkage: Linkage,
    pub forecast_horizon: usize,
    pub preview_rows: usize,
    pub batch_concurrency: usize,
    pub max_cache_entry_bytes: usize,
    pub cache_memory_ceiling: u64,
    pub abort_grace_ms: u64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_rows_per_sheet: default_max_rows_per_sheet(),
            max_sheets: default_max_sheets(),
            enable_streaming: default_true(),
            enable_workers: default_true(),
            worker_count: default_worker_count(),
            chunk_size: default_chunk_size(),
            timeout: default_timeout_ms(),
            enable_cache: default_true(),
            cache_size: default_cache_size(),
            precision_mode: false,
            force_headers: false,
            enable_advanced_analysis: false,
            enable_ml: false,
            enable_time_series: false,
            enable_clustering: false,
            force_streaming: false,
            force_parallel: false,
            correlation_threshold: 0.5,
            min_support: 0.1,
            max_clusters: 8,
            dbscan_min_pts: 5,
            linkage: Linkage::Average,
            forecast_horizon: 12,
            preview_rows: 100,
            batch_concurrency: 3,
            max_cache_entry_bytes: 10 * MIB as usize,
            cache_memory_ceiling: 512 * MIB,
            abort_grace_ms: 5_000,
        }
    }
}

impl AnalysisOptions {
    /// Parses options from JSON, rejecting unknown keys, then validates them.
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        let options: AnalysisOptions = serde_json::from_str(raw)
            .map_err(|e| EngineError::InvalidConfiguration(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfiguration(msg.to_string()));

        if self.max_file_size == 0 {
            return invalid("maxFileSize must be greater than zero");
        }
        if self.max_rows_per_sheet == 0 {
            return invalid("maxRowsPerSheet must be greater than zero");
        }
        if self.max_sheets == 0 {
            return invalid("maxSheets must be greater than zero");
        }
        if self.worker_count == 0 {
            return invalid("workerCount must be at least 1");
        }
        if self.chunk_size == 0 {
            return invalid("chunkSize must be greater than zero");
        }
        if self.timeout == 0 {
            return invalid("timeout must be greater than zero");
        }
        if self.cache_size == 0 {
            return invalid("cacheSize must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.correlation_threshold) {
            return invalid("correlationThreshold must be within [0, 1]");
        }
        if !(self.min_support > 0.0 && self.min_support <= 1.0) {
            return invalid("minSupport must be within (0, 1]");
        }
        if self.max_clusters < 2 {
            return invalid("maxClusters must be at least 2");
        }
        if self.dbscan_min_pts == 0 {
            return invalid("dbscanMinPts must be at least 1");
        }
        if self.batch_concurrency == 0 {
            return invalid("batchConcurrency must be at least 1");
        }
        Ok(())
    }

    pub fn advanced_requested(&self) -> bool {
        self.enable_advanced_analysis
            || self.enable_ml
            || self.enable_clustering
            || self.enable_time_series
    }
}

/// Loads options for the binary: `.env`, then an optional JSON file named by
/// `SHEET_ENGINE_CONFIG`, then individual env overrides.
pub fn load_config() -> Result<AnalysisOptions> {
    // Load .env file first
    dotenv().ok();

    let mut options = match std::env::var("SHEET_ENGINE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read options file {}", path))?;
            AnalysisOptions::from_json(&raw)?
        }
        Err(_) => AnalysisOptions::default(),
    };

    if let Ok(workers) = std::env::var("SHEET_ENGINE_WORKERS") {
        options.worker_count = workers
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse SHEET_ENGINE_WORKERS: {}", e))?;
    }
    if let Ok(max_size) = std::env::var("SHEET_ENGINE_MAX_FILE_SIZE") {
        options.max_file_size = max_size
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse SHEET_ENGINE_MAX_FILE_SIZE: {}", e))?;
    }

    options.validate()?;
    Ok(options)
}
