//! Database bootstrap command: `futureproof init-db`.

use anyhow::{Context, Result};
use futureproof::config::AppConfig;
use futureproof::db::AnalysisDb;

pub fn cmd_init_db(config: &AppConfig) -> Result<()> {
    let path = &config.server.db_path;
    AnalysisDb::new(path)
        .with_context(|| format!("Failed to initialize database at {}", path.display()))?;
    println!("Database initialized at {}", path.display());
    Ok(())
}
