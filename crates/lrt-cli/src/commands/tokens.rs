use std::collections::BTreeMap;
use std::path::Path;

use lrt_token::view::OVERVIEW_BRANCHES;
use lrt_token::{TokenBuilder, TokenHandler, TokenJsonBuilder};
use serde_json::Value;

use super::views::overview_name;

pub async fn create(
    handler: TokenHandler,
    file: &Path,
    suffix: &str,
    attach: Option<(&Path, &str)>,
) -> anyhow::Result<()> {
    let builder = TokenJsonBuilder::from_path(file)?;
    let id = handler
        .create_token(Some(builder.data().clone()), suffix, attach)
        .await?;
    println!("✓ Created token {id}");
    if let Some((_, name)) = attach {
        println!("  Attachment: {name}");
    }
    Ok(())
}

pub async fn list(mut handler: TokenHandler, view: &str) -> anyhow::Result<()> {
    let Some(rows) = handler.list_tokens_from_view(view).await? else {
        anyhow::bail!("view {view} does not exist for {}", handler.token_type());
    };
    for row in rows {
        println!("{}\t{}\t{}", row.id.as_deref().unwrap_or("-"), row.key, row.value);
    }
    Ok(())
}

pub async fn overview(mut handler: TokenHandler) -> anyhow::Result<()> {
    let counts = overview_counts(&mut handler).await?;
    for (label, _) in OVERVIEW_BRANCHES {
        println!("{label:<12} {}", counts.get(label).copied().unwrap_or(0));
    }
    Ok(())
}

/// Per-state counts from the installed overview view.
pub(crate) async fn overview_counts(handler: &mut TokenHandler) -> anyhow::Result<BTreeMap<String, i64>> {
    handler.load_views().await?;
    let Some(view) = overview_name(handler) else {
        anyhow::bail!(
            "no overview view for {}; run `lrt views -t {} install`",
            handler.token_type(),
            handler.token_type()
        );
    };
    let rows = handler.list_tokens_from_view(view).await?.unwrap_or_default();
    Ok(rows
        .into_iter()
        .filter_map(|row| match (row.key, row.value.as_i64()) {
            (Value::String(label), Some(count)) => Some((label, count)),
            _ => None,
        })
        .collect())
}

pub async fn reset(mut handler: TokenHandler, view: &str, del_attach: bool) -> anyhow::Result<()> {
    let docs = handler.reset_tokens(view, None, del_attach).await?;
    println!("✓ Reset {} tokens from {view}", docs.len());
    Ok(())
}

pub async fn set_status(mut handler: TokenHandler, view: &str, status: &str) -> anyhow::Result<()> {
    let count = handler.set_view_to_status(view, status).await?;
    println!("✓ Set {count} tokens from {view} to {status}");
    Ok(())
}

pub async fn delete(mut handler: TokenHandler, view: &str) -> anyhow::Result<()> {
    let count = handler.delete_tokens(view, None).await?;
    println!("✓ Deleted {count} tokens from {view}");
    Ok(())
}

pub async fn attachment(handler: TokenHandler, id: &str, name: &str, dir: &Path) -> anyhow::Result<()> {
    let path = handler.get_attachment(id, name, dir, None).await?;
    println!("✓ Saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrt_store::{DocumentStore, EmbeddedStore};
    use std::sync::Arc;

    fn handler() -> TokenHandler {
        let store: Arc<dyn DocumentStore> = Arc::new(EmbeddedStore::open_in_memory("tokens").unwrap());
        TokenHandler::new("job", store).unwrap()
    }

    #[tokio::test]
    async fn create_from_file_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token.json");
        std::fs::write(
            &file,
            r#"{"PicasApiVersion": 0.5, "Token": {"OBSID": "L123456"}, "variables": {"_avg": 4}}"#,
        )
        .unwrap();

        let mut h = handler();
        h.add_status_views().await.unwrap();
        h.add_overview_view().await.unwrap();
        let store = Arc::clone(h.store());
        create(h, &file, "SB000", None).await.unwrap();

        let doc = store.get_document("t_job_SB000").await.unwrap();
        assert_eq!(doc.get("OBSID"), Some(&serde_json::json!("L123456")));

        let mut h = TokenHandler::new("job", store).unwrap();
        let counts = overview_counts(&mut h).await.unwrap();
        assert_eq!(counts.get("todo"), Some(&1));
    }

    #[tokio::test]
    async fn overview_without_views_is_an_error() {
        let mut h = handler();
        assert!(overview_counts(&mut h).await.is_err());
        assert!(list(h, "todo").await.is_err());
    }
}
