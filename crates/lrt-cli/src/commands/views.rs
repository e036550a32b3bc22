use std::sync::Arc;

use lrt_store::DocumentStore;
use lrt_token::{OVERVIEW_TOTAL, TokenHandler, get_all_design_docs};

pub async fn install(mut handler: TokenHandler) -> anyhow::Result<()> {
    handler.add_status_views().await?;
    handler.add_overview_view().await?;
    println!("✓ Installed views for {}", handler.token_type());
    for name in handler.views().keys() {
        println!("  {name}");
    }
    Ok(())
}

pub async fn add(
    mut handler: TokenHandler,
    name: &str,
    condition: &str,
    emit: (&str, &str),
) -> anyhow::Result<()> {
    handler.add_view(name, condition, emit).await?;
    println!("✓ Added view {name}");
    Ok(())
}

pub async fn list(mut handler: TokenHandler) -> anyhow::Result<()> {
    handler.load_views().await?;
    if handler.views().is_empty() {
        println!("No views for {}", handler.token_type());
        return Ok(());
    }
    for (name, code) in handler.views() {
        let kind = if code.reduce.is_some() { "map/reduce" } else { "map" };
        println!("{name:<20} {kind}");
    }
    Ok(())
}

pub async fn delete(mut handler: TokenHandler, name: Option<&str>) -> anyhow::Result<()> {
    match name {
        Some(name) => {
            handler.del_view(name).await?;
            println!("✓ Deleted view {name}");
        }
        None => {
            handler.load_views().await?;
            let names: Vec<String> = handler.views().keys().cloned().collect();
            for name in &names {
                handler.del_view(name).await?;
            }
            println!("✓ Deleted {} views", names.len());
        }
    }
    Ok(())
}

pub async fn design_docs(store: Arc<dyn DocumentStore>) -> anyhow::Result<()> {
    let ids = get_all_design_docs(store.as_ref()).await?;
    if ids.is_empty() {
        println!("No design documents in {}", store.name());
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

/// Name of the overview view installed for this handler, if any.
pub(crate) fn overview_name(handler: &TokenHandler) -> Option<&'static str> {
    [OVERVIEW_TOTAL, lrt_token::OVERVIEW_VIEW]
        .into_iter()
        .find(|name| handler.views().contains_key(*name))
}
