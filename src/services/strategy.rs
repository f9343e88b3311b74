use serde::Serialize;

use crate::config::AnalysisOptions;
use crate::error::EngineError;

const MB: u64 = 1024 * 1024;
pub const STREAMING_THRESHOLD: u64 = 100 * MB;
pub const PARALLEL_THRESHOLD: u64 = 50 * MB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Traditional,
    Streaming,
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStrategy {
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub reason: String,
    /// Rough working-set estimate for telemetry; never enforced.
    pub estimated_memory: u64,
}

fn estimate_memory(kind: StrategyKind, size: u64) -> u64 {
    match kind {
        StrategyKind::Streaming => (50 * MB).min(size / 10),
        StrategyKind::Parallel => size.saturating_mul(2),
        StrategyKind::Traditional => size.saturating_mul(3),
    }
}

/// Picks an ingestion strategy. Pure in `(size, options)`.
pub fn select_strategy(size: u64, options: &AnalysisOptions) -> Result<AnalysisStrategy, EngineError> {
    if size > options.max_file_size {
        return Err(EngineError::SizeLimitExceeded { size, limit: options.max_file_size });
    }

    let (kind, reason) = if options.force_streaming {
        (StrategyKind::Streaming, "streaming forced by options")
    } else if options.force_parallel {
        (StrategyKind::Parallel, "parallel processing forced by options")
    } else if size > STREAMING_THRESHOLD && options.enable_streaming {
        (StrategyKind::Streaming, "file larger than 100MB")
    } else if size > PARALLEL_THRESHOLD && options.enable_workers {
        (StrategyKind::Parallel, "file larger than 50MB")
    } else {
        (StrategyKind::Traditional, "file fits comfortably in memory")
    };

    Ok(AnalysisStrategy {
        kind,
        reason: reason.to_string(),
        estimated_memory: estimate_memory(kind, size),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        let options = AnalysisOptions::default();
        assert_eq!(select_strategy(10 * MB, &options).unwrap().kind, StrategyKind::Traditional);
        assert_eq!(select_strategy(60 * MB, &options).unwrap().kind, StrategyKind::Parallel);
        assert_eq!(select_strategy(150 * MB, &options).unwrap().kind, StrategyKind::Streaming);
    }

    #[test]
    fn capability_flags_gate_thresholds() {
        let options = AnalysisOptions { enable_streaming: false, ..Default::default() };
        assert_eq!(select_strategy(150 * MB, &options).unwrap().kind, StrategyKind::Parallel);
        let options = AnalysisOptions { enable_streaming: false, enable_workers: false, ..Default::default() };
        assert_eq!(select_strategy(150 * MB, &options).unwrap().kind, StrategyKind::Traditional);
    }

    #[test]
    fn overrides_win() {
        let options = AnalysisOptions { force_parallel: true, ..Default::default() };
        assert_eq!(select_strategy(1024, &options).unwrap().kind, StrategyKind::Parallel);
        let options = AnalysisOptions { force_streaming: true, force_parallel: true, ..Default::default() };
        assert_eq!(select_strategy(1024, &options).unwrap().kind, StrategyKind::Streaming);
    }

    #[test]
    fn size_limit_comes_first() {
        let options = AnalysisOptions { max_file_size: 100, force_streaming: true, ..Default::default() };
        let err = select_strategy(101, &options).unwrap_err();
        assert!(matches!(err, EngineError::SizeLimitExceeded { size: 101, limit: 100 }));
    }

    #[test]
    fn memory_estimates() {
        let options = AnalysisOptions::default();
        assert_eq!(select_strategy(10 * MB, &options).unwrap().estimated_memory, 30 * MB);
        assert_eq!(select_strategy(200 * MB, &options).unwrap().estimated_memory, 20 * MB);
        assert_eq!(select_strategy(499 * MB, &options).unwrap().estimated_memory, (499 * MB / 10).min(50 * MB));
    }

    #[test]
    fn deterministic() {
        let options = AnalysisOptions::default();
        assert_eq!(select_strategy(77 * MB, &options).unwrap(), select_strategy(77 * MB, &options).unwrap());
    }
}
