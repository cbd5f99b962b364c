//! `fax-watch run`: watch until interrupted

use crate::cli::app::RunArgs;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use fax_watch_core::{Document, FeedServer, LifecycleEvent, ResilientWatcher, WatcherConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

pub async fn execute(config_path: &Path, args: RunArgs) -> Result<()> {
    let mut config = WatcherConfig::from_file(config_path)?;
    apply_overrides(&mut config, args);

    info!("Watching {} sources", config.sources.len());
    for source in &config.sources {
        debug!(
            "Source {:?}: id={:?} name={:?} label={:?}",
            source.path, source.id, source.name, source.label
        );
    }

    let bind = config.feed.bind;
    let watcher = Arc::new(ResilientWatcher::new(config).context("Invalid watcher configuration")?);
    let logger = tokio::spawn(log_events(watcher.subscribe()));
    let handle = Arc::clone(&watcher).spawn();

    let feed = match bind {
        Some(addr) => {
            let server = FeedServer::bind(addr, Arc::clone(&watcher)).await?;
            Some(tokio::spawn(async move {
                if let Err(e) = server.serve().await {
                    error!("Feed stopped: {}", e);
                }
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutting down");

    if let Some(feed) = feed {
        feed.abort();
    }
    handle.shutdown().await;
    logger.abort();

    Ok(())
}

fn apply_overrides(config: &mut WatcherConfig, args: RunArgs) {
    if let Some(dir) = args.archive_dir {
        config.archive_dir = Some(dir);
    }
    if let Some(bind) = args.bind {
        config.feed.bind = Some(bind);
    }
}

async fn log_events(mut events: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => warn!("Event log fell behind, skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Created { document, resync } => {
            let note = if *resync { " (resync)" } else { "" };
            info!("created{} {}", note, describe(document));
        }
        LifecycleEvent::Renamed { document, previous_path } => {
            info!("renamed {:?} -> {}", previous_path, describe(document));
        }
        LifecycleEvent::Changed { document, .. } => info!("changed {}", describe(document)),
        LifecycleEvent::Deleted { document } => {
            info!("deleted {} {}", document.origin_directory_label, document.file_name);
        }
        LifecycleEvent::Copy { document, destination } => {
            debug!("copy {} -> {:?}", document.file_name, destination);
        }
        LifecycleEvent::Warning { code, path, .. } => warn!("{}: {:?}", code, path),
        LifecycleEvent::Error { code, message } => error!("{}: {}", code, message),
    }
}

fn describe(document: &Document) -> String {
    format!(
        "{} {} ctime {} mtime {}",
        document.origin_directory_label,
        document.file_name,
        local_time(document.created_at),
        local_time(document.modified_at)
    )
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
