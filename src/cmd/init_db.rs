//! Database bootstrap command: `vibe init-db`.

use anyhow::{Context, Result};
use vibe::config::VibeConfig;
use vibe::store::DbHandle;

pub fn cmd_init_db(config: &VibeConfig) -> Result<()> {
    let path = &config.server.db_path;
    DbHandle::open(path)
        .with_context(|| format!("Failed to initialize database at {}", path.display()))?;
    println!("Database initialized at {}", path.display());
    Ok(())
}
