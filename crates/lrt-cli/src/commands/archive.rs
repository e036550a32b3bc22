use std::path::Path;
use std::sync::Arc;

use lrt_store::DocumentStore;
use lrt_token::TokenHandler;

pub async fn archive(mut handler: TokenHandler, dir: &Path, compress: bool, delete: bool) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = handler.archive_tokens(dir, delete, compress).await?;
    println!("✓ Archived {} tokens", handler.token_type());
    println!("  Output: {}", path.display());
    if delete {
        println!("  Tokens and views removed from the database");
    }
    Ok(())
}

pub async fn purge(store: Arc<dyn DocumentStore>, token_type: &str) -> anyhow::Result<()> {
    lrt_token::purge_tokens(store, token_type).await?;
    println!("✓ Purged {token_type}");
    Ok(())
}
