//! `fax-watch scan`: one-shot fingerprint of every source

use anyhow::{Context, Result};
use fax_watch_core::monitor::DocumentFilter;
use fax_watch_core::{ContentIdentifier, Document, WatcherConfig};
use std::path::Path;
use tracing::{info, warn};

pub async fn execute(config_path: &Path) -> Result<()> {
    let config = WatcherConfig::from_file(config_path)?;
    let documents = scan_sources(&config).await?;
    info!("Found {} documents", documents.len());
    println!("{}", serde_json::to_string_pretty(&documents)?);
    Ok(())
}

/// Fingerprint every accepted file, sorted by path
pub async fn scan_sources(config: &WatcherConfig) -> Result<Vec<Document>> {
    let filter = DocumentFilter::new(&config.extension);
    let identifier = ContentIdentifier::new();
    let mut documents = Vec::new();

    for source in &config.sources {
        if !source.is_reachable() {
            warn!("Skipping unreachable source {:?}", source.path);
            continue;
        }

        let mut entries = tokio::fs::read_dir(&source.path)
            .await
            .with_context(|| format!("Failed to list {}", source.path.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !filter.accepts(&path) {
                continue;
            }
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };
            match identifier.identify(&path).await {
                Ok(fingerprint) => documents.push(Document::observe(&path, fingerprint, &metadata)),
                Err(e) => warn!("Skipping {:?}: {}", path, e),
            }
        }
    }

    documents.sort_by(|a, b| a.source_path.cmp(&b.source_path));
    Ok(documents)
}
