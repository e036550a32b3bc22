use std::path::Path;

use lrt_core::LrtConfig;

pub fn init(path: &Path, database: &str) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let config = LrtConfig::scaffold(database);
    std::fs::write(path, config.to_toml_string()?)?;
    println!("✓ Wrote {}", path.display());
    println!("  Server:   {}", config.server.url);
    println!("  Database: {database}");
    Ok(())
}
