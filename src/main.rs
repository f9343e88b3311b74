use anyhow::{bail, Result};

use sheet_engine::{config, logging, AnalysisEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    logging::init_logging()?;

    // Load configuration
    let options = config::load_config()?;

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        bail!("usage: sheet_engine <workbook> [<workbook>...]");
    }

    let engine = AnalysisEngine::new(options)?;
    let output = if paths.len() == 1 {
        serde_json::to_string_pretty(&engine.analyze(&paths[0]).await)?
    } else {
        serde_json::to_string_pretty(&engine.analyze_batch(&paths).await)?
    };
    println!("{}", output);

    tracing::debug!("Final status: {:?}", engine.system_status());
    Ok(())
}
