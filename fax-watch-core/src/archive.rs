//! Archival copies of newly created documents

use crate::config::WatchedSource;
use crate::document::Document;
use crate::error::{Result, WatchError};
use crate::events::{LifecycleEvent, LifecycleEventBus, WarningCode};
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sorts chronologically, e.g. `2013-04-27 08h53m00ss`
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %Hh%Mm%Sss";

/// Copies new documents into the archive directory
#[derive(Debug, Clone)]
pub struct ArchivalCopier {
    archive_dir: PathBuf,
}

impl ArchivalCopier {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self { archive_dir: archive_dir.into() }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Deterministic archive path: timestamp, source label, original name
    pub fn destination_for(&self, document: &Document, source: Option<&WatchedSource>) -> PathBuf {
        self.archive_dir.join(archive_file_name(document, source))
    }

    /// Copy the document's file into the archive
    ///
    /// A failure is blamed on the source only if the source is gone
    /// afterwards.
    pub async fn copy(&self, document: &Document, source: Option<&WatchedSource>) -> Result<PathBuf> {
        let destination = self.destination_for(document, source);
        if let Err(err) = tokio::fs::copy(&document.source_path, &destination).await {
            let source_present = tokio::fs::symlink_metadata(&document.source_path).await.is_ok();
            return Err(if source_present {
                WatchError::Archive { path: destination, source: err }
            } else {
                WatchError::SourceVanished { path: document.source_path.clone(), source: err }
            });
        }
        Ok(destination)
    }

    /// Copy and report the outcome on the bus
    ///
    /// A failed copy becomes a `SOURCE_VANISHED` or `ARCHIVE_FAILED`
    /// warning; the `created` event that preceded it stands.
    pub async fn archive(
        &self,
        document: Document,
        source: Option<WatchedSource>,
        bus: &LifecycleEventBus,
    ) {
        match self.copy(&document, source.as_ref()).await {
            Ok(destination) => {
                debug!("Archived {:?} to {:?}", document.source_path, destination);
                bus.publish(LifecycleEvent::Copy { document, destination });
            }
            Err(e) => {
                warn!("{}", e);
                let (code, path) = match e {
                    WatchError::Archive { path, .. } => (WarningCode::ArchiveFailed, path),
                    _ => (WarningCode::SourceVanished, document.source_path.clone()),
                };
                bus.publish(LifecycleEvent::Warning { code, document: Some(document), path: Some(path) });
            }
        }
    }
}

fn archive_file_name(document: &Document, source: Option<&WatchedSource>) -> String {
    let label = source.and_then(|s| s.label.as_deref()).unwrap_or("-");
    format!(
        "{} {} {}",
        format_timestamp(document.earliest_timestamp()),
        label,
        document.file_name
    )
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Fingerprint;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_archive_name_uses_earlier_timestamp_and_label() {
        let doc = Document::from_parts(
            Path::new("/in/2F_C2230/scan.pdf"),
            Fingerprint::new("h1"),
            local(2013, 4, 27, 9, 0, 0),
            local(2013, 4, 27, 8, 53, 0),
        );
        let source = WatchedSource::new("/in/2F_C2230").with_label("2F");

        let copier = ArchivalCopier::new("/archive");
        assert_eq!(
            copier.destination_for(&doc, Some(&source)),
            PathBuf::from("/archive/2013-04-27 08h53m00ss 2F scan.pdf")
        );
    }

    #[test]
    fn test_archive_name_without_label() {
        let at = local(2024, 1, 2, 3, 4, 5);
        let doc = Document::from_parts(Path::new("/in/x/a.pdf"), Fingerprint::new("h1"), at, at);
        assert_eq!(archive_file_name(&doc, None), "2024-01-02 03h04m05ss - a.pdf");
    }

    #[tokio::test]
    async fn test_archive_copies_and_publishes() {
        let inbox = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let path = inbox.path().join("a.pdf");
        std::fs::write(&path, b"scan").unwrap();

        let at = Utc::now();
        let doc = Document::from_parts(&path, Fingerprint::new("h1"), at, at);
        let bus = LifecycleEventBus::new(8);
        let mut rx = bus.subscribe();

        ArchivalCopier::new(archive.path()).archive(doc, None, &bus).await;

        match rx.recv().await.unwrap() {
            LifecycleEvent::Copy { destination, .. } => {
                assert_eq!(std::fs::read(destination).unwrap(), b"scan");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_vanished_source_is_warning() {
        let inbox = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let at = Utc::now();
        let doc = Document::from_parts(&inbox.path().join("gone.pdf"), Fingerprint::new("h1"), at, at);
        let bus = LifecycleEventBus::new(8);
        let mut rx = bus.subscribe();

        ArchivalCopier::new(archive.path()).archive(doc, None, &bus).await;

        match rx.recv().await.unwrap() {
            LifecycleEvent::Warning { code, document, .. } => {
                assert_eq!(code, WarningCode::SourceVanished);
                assert_eq!(document.unwrap().file_name, "gone.pdf");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unwritable_archive_is_not_blamed_on_source() {
        let inbox = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let path = inbox.path().join("a.pdf");
        std::fs::write(&path, b"scan").unwrap();
        let missing = archive.path().join("not-created");

        let at = Utc::now();
        let doc = Document::from_parts(&path, Fingerprint::new("h1"), at, at);
        let bus = LifecycleEventBus::new(8);
        let mut rx = bus.subscribe();

        ArchivalCopier::new(&missing).archive(doc, None, &bus).await;

        match rx.recv().await.unwrap() {
            LifecycleEvent::Warning { code, document, path: reported } => {
                assert_eq!(code, WarningCode::ArchiveFailed);
                assert_eq!(document.unwrap().source_path, path);
                assert!(reported.unwrap().starts_with(&missing));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(path.exists());
    }
}
