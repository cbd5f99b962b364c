//! Document lifecycle resolution
//!
//! The resolver owns every registry mutation of a session. Notifications are
//! fingerprinted concurrently but applied strictly in arrival order, so an
//! `add` followed by a `change` for the same path can never be applied the
//! other way round.
//!
//! Renames are recognised by content: the primitive reports them as an
//! unlink/add pair, and a fingerprint already in the registry under another
//! path is the only reliable correlation. Unlinks are provisional for a grace
//! period so that devices replacing a file via delete + recreate do not
//! produce a spurious `deleted`.

use crate::archive::ArchivalCopier;
use crate::config::WatcherConfig;
use crate::document::{Document, Fingerprint};
use crate::error::{Result, WatchError};
use crate::events::{LifecycleEvent, LifecycleEventBus, WarningCode};
use crate::identity::ContentIdentifier;
use crate::monitor::RawNotification;
use crate::registry::{SharedRegistry, UnlinkMark};
use futures::future::{self, BoxFuture};
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Work items consumed by the resolver loop
#[derive(Debug, Clone)]
pub enum SessionInput {
    Notify(RawNotification),
    /// Grace period elapsed for an unlinked document
    ConfirmUnlink { fingerprint: Fingerprint, path: PathBuf, mark: UnlinkMark },
}

/// An input with its I/O already performed, ready to apply
enum Step {
    Observed { resync: bool, outcome: Result<Document> },
    Unlink { path: PathBuf },
    Confirm { fingerprint: Fingerprint, path: PathBuf, mark: UnlinkMark },
}

/// Registry outcome of one observation, published after the lock is released
enum Resolution {
    Unchanged,
    Created(Document),
    Renamed { document: Document, previous_path: PathBuf, overwritten: Option<Document> },
    Changed { document: Document, previous: Fingerprint },
}

pub struct Resolver {
    config: Arc<WatcherConfig>,
    registry: SharedRegistry,
    bus: LifecycleEventBus,
    identifier: ContentIdentifier,
    copier: Option<ArchivalCopier>,
    /// Weak so that pending confirmations never keep a closed session alive
    inbox: mpsc::WeakUnboundedSender<SessionInput>,
}

impl Resolver {
    pub fn new(
        config: Arc<WatcherConfig>,
        registry: SharedRegistry,
        bus: LifecycleEventBus,
        copier: Option<ArchivalCopier>,
        inbox: mpsc::WeakUnboundedSender<SessionInput>,
    ) -> Self {
        Self { config, registry, bus, identifier: ContentIdentifier::new(), copier, inbox }
    }

    /// Process inputs until every sender is gone and in-flight work is applied
    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        let mut in_flight: FuturesOrdered<BoxFuture<'static, Step>> = FuturesOrdered::new();
        let mut open = true;

        while open || !in_flight.is_empty() {
            tokio::select! {
                input = inbox.recv(), if open => match input {
                    Some(input) => in_flight.push_back(self.prepare(input)),
                    None => open = false,
                },
                Some(step) = in_flight.next(), if !in_flight.is_empty() => self.apply(step),
            }
        }
        trace!("Resolver stopped");
    }

    /// Start the I/O for an input; hashing may overlap across files
    fn prepare(&self, input: SessionInput) -> BoxFuture<'static, Step> {
        match input {
            SessionInput::Notify(RawNotification::Add { path, resync }) => {
                observe(self.identifier, path, resync).boxed()
            }
            SessionInput::Notify(RawNotification::Change { path }) => {
                observe(self.identifier, path, false).boxed()
            }
            SessionInput::Notify(RawNotification::Unlink { path }) => {
                future::ready(Step::Unlink { path }).boxed()
            }
            SessionInput::ConfirmUnlink { fingerprint, path, mark } => {
                future::ready(Step::Confirm { fingerprint, path, mark }).boxed()
            }
        }
    }

    fn apply(&self, step: Step) {
        match step {
            Step::Observed { resync, outcome: Ok(document) } => self.resolve_observation(document, resync),
            Step::Observed { outcome: Err(e), .. } => {
                // Not a deletion; a real removal arrives as its own unlink.
                warn!("Observation aborted: {}", e);
            }
            Step::Unlink { path } => self.resolve_unlink(path),
            Step::Confirm { fingerprint, path, mark } => self.confirm_unlink(&fingerprint, &path, mark),
        }
    }

    fn resolve_observation(&self, document: Document, resync: bool) {
        let fingerprint = document.fingerprint.clone();
        let path = document.source_path.clone();

        let resolution = {
            let mut registry = self.registry.write();
            let known_path = registry
                .lookup_by_fingerprint(&fingerprint)
                .map(|d| d.source_path.clone());

            match known_path {
                Some(known) if known == path => {
                    registry.upsert_by_fingerprint(fingerprint, document);
                    Resolution::Unchanged
                }
                Some(previous_path) => {
                    let overwritten = registry.upsert_by_fingerprint(fingerprint, document.clone());
                    Resolution::Renamed { document, previous_path, overwritten }
                }
                None => match registry.upsert_by_fingerprint(fingerprint, document.clone()) {
                    Some(old) => Resolution::Changed { document, previous: old.fingerprint },
                    None => Resolution::Created(document),
                },
            }
        };

        match resolution {
            Resolution::Unchanged => {
                debug!("{:?} observed with unchanged content", path);
            }
            Resolution::Created(document) => {
                debug!(
                    "created {} {} ({})",
                    document.origin_directory_label,
                    document.file_name,
                    document.fingerprint.short()
                );
                self.bus.publish(LifecycleEvent::Created { document: document.clone(), resync });
                self.spawn_archive(document);
            }
            Resolution::Renamed { document, previous_path, overwritten } => {
                if let Some(old) = overwritten {
                    debug!("deleted {} {} (overwritten by rename)", old.origin_directory_label, old.file_name);
                    self.bus.publish(LifecycleEvent::Deleted { document: old });
                }
                debug!("renamed {:?} -> {:?}", previous_path, document.source_path);
                self.bus.publish(LifecycleEvent::Renamed { document, previous_path });
            }
            Resolution::Changed { document, previous } => {
                debug!(
                    "changed {} {} ({} -> {})",
                    document.origin_directory_label,
                    document.file_name,
                    previous.short(),
                    document.fingerprint.short()
                );
                self.bus.publish(LifecycleEvent::Changed { document, previous });
            }
        }
    }

    fn resolve_unlink(&self, path: PathBuf) {
        let target = {
            let mut registry = self.registry.write();
            let fingerprint = registry.lookup_by_path(&path).map(|d| d.fingerprint.clone());
            fingerprint.and_then(|fp| registry.mark_pending_unlink(&fp).map(|mark| (fp, mark)))
        };

        match target {
            Some((fingerprint, mark)) => {
                debug!("{:?} unlinked, confirming in {:?}", path, self.config.timing.grace_period());
                self.schedule_confirmation(fingerprint, path, mark);
            }
            None => {
                warn!("{}", WatchError::UnmatchedUnlink { path: path.clone() });
                self.bus.publish(LifecycleEvent::Warning {
                    code: WarningCode::UnmatchedUnlink,
                    document: None,
                    path: Some(path),
                });
            }
        }
    }

    /// Re-enter the resolver after the grace period
    ///
    /// The timer is never cancelled; the confirmation re-checks live state
    /// instead, so a document that reappeared or was unlinked again in the
    /// meantime is left alone.
    fn schedule_confirmation(&self, fingerprint: Fingerprint, path: PathBuf, mark: UnlinkMark) {
        let inbox = self.inbox.clone();
        let grace = self.config.timing.grace_period();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match inbox.upgrade() {
                Some(tx) => {
                    let _ = tx.send(SessionInput::ConfirmUnlink { fingerprint, path, mark });
                }
                None => trace!("Session closed before unlink of {:?} was confirmed", path),
            }
        });
    }

    fn confirm_unlink(&self, fingerprint: &Fingerprint, path: &Path, mark: UnlinkMark) {
        let removed = self.registry.write().confirm_unlink(fingerprint, path, mark);

        match removed {
            Some(document) => {
                debug!("deleted {} {}", document.origin_directory_label, document.file_name);
                self.bus.publish(LifecycleEvent::Deleted { document });
            }
            None => trace!("Unlink of {:?} was reversed", path),
        }
    }

    fn spawn_archive(&self, document: Document) {
        let Some(copier) = self.copier.clone() else {
            return;
        };
        let bus = self.bus.clone();
        let source = self.config.source_for_dir(&document.origin_directory).cloned();
        tokio::spawn(async move {
            copier.archive(document, source, &bus).await;
        });
    }
}

async fn observe(identifier: ContentIdentifier, path: PathBuf, resync: bool) -> Step {
    let outcome = read_document(identifier, &path).await;
    Step::Observed { resync, outcome }
}

/// Symbolic links are never followed; only regular files become documents
async fn read_document(identifier: ContentIdentifier, path: &Path) -> Result<Document> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|source| WatchError::Read { path: path.to_path_buf(), source })?;
    if !metadata.is_file() {
        return Err(WatchError::Read {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }
    let fingerprint = identifier.identify(path).await?;
    Ok(Document::observe(path, fingerprint, &metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchedSource;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;
    use tokio::time::{sleep, timeout};

    struct Harness {
        dir: TempDir,
        registry: SharedRegistry,
        events: broadcast::Receiver<LifecycleEvent>,
        inbox: Option<mpsc::UnboundedSender<SessionInput>>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start(grace_ms: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = WatcherConfig::new(vec![WatchedSource::new(dir.path())]);
            config.timing.grace_period_ms = grace_ms;

            let registry = SharedRegistry::new();
            let bus = LifecycleEventBus::new(64);
            let events = bus.subscribe();
            let (tx, rx) = mpsc::unbounded_channel();
            let resolver = Resolver::new(Arc::new(config), registry.clone(), bus, None, tx.downgrade());
            let task = tokio::spawn(resolver.run(rx));

            Self { dir, registry, events, inbox: Some(tx), task }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn send(&self, notification: RawNotification) {
            self.inbox.as_ref().unwrap().send(SessionInput::Notify(notification)).unwrap();
        }

        fn add(&self, name: &str) {
            self.send(RawNotification::Add { path: self.path(name), resync: false });
        }

        fn unlink(&self, name: &str) {
            self.send(RawNotification::Unlink { path: self.path(name) });
        }

        async fn next(&mut self) -> LifecycleEvent {
            timeout(Duration::from_secs(5), self.events.recv()).await.unwrap().unwrap()
        }

        async fn quiet(&mut self, wait: Duration) -> Vec<LifecycleEvent> {
            sleep(wait).await;
            let mut seen = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                seen.push(event);
            }
            seen
        }

        async fn finish(mut self) {
            self.inbox.take();
            timeout(Duration::from_secs(5), self.task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_add_creates_document() {
        let mut h = Harness::start(100);
        std::fs::write(h.path("a.pdf"), b"one").unwrap();
        h.add("a.pdf");

        match h.next().await {
            LifecycleEvent::Created { document, resync } => {
                assert_eq!(document.file_name, "a.pdf");
                assert!(!resync);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.registry.snapshot().len(), 1);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_rename_add_first() {
        let mut h = Harness::start(100);
        std::fs::write(h.path("a.pdf"), b"same").unwrap();
        h.add("a.pdf");
        assert_eq!(h.next().await.name(), "created");

        std::fs::rename(h.path("a.pdf"), h.path("b.pdf")).unwrap();
        h.add("b.pdf");
        h.unlink("a.pdf");

        match h.next().await {
            LifecycleEvent::Renamed { document, previous_path } => {
                assert_eq!(document.source_path, h.path("b.pdf"));
                assert_eq!(previous_path, h.path("a.pdf"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let rest = h.quiet(Duration::from_millis(300)).await;
        assert!(rest.iter().all(|e| !matches!(e, LifecycleEvent::Created { .. } | LifecycleEvent::Deleted { .. })));

        let docs = h.registry.snapshot();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_path, h.path("b.pdf"));
        h.finish().await;
    }

    #[tokio::test]
    async fn test_rename_unlink_first() {
        let mut h = Harness::start(200);
        std::fs::write(h.path("a.pdf"), b"same").unwrap();
        h.add("a.pdf");
        assert_eq!(h.next().await.name(), "created");

        std::fs::rename(h.path("a.pdf"), h.path("b.pdf")).unwrap();
        h.unlink("a.pdf");
        h.add("b.pdf");

        assert_eq!(h.next().await.name(), "renamed");
        let rest = h.quiet(Duration::from_millis(400)).await;
        assert!(rest.is_empty(), "unexpected events {rest:?}");
        assert!(!h.registry.snapshot()[0].pending_unlink);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_unlink_then_readd_within_grace_is_silent() {
        let mut h = Harness::start(200);
        std::fs::write(h.path("a.pdf"), b"same").unwrap();
        h.add("a.pdf");
        assert_eq!(h.next().await.name(), "created");

        h.unlink("a.pdf");
        h.add("a.pdf");

        let rest = h.quiet(Duration::from_millis(400)).await;
        assert!(rest.is_empty(), "unexpected events {rest:?}");
        assert_eq!(h.registry.snapshot().len(), 1);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_unlink_confirmed_after_grace() {
        let mut h = Harness::start(200);
        std::fs::write(h.path("a.pdf"), b"one").unwrap();
        h.add("a.pdf");
        assert_eq!(h.next().await.name(), "created");

        std::fs::remove_file(h.path("a.pdf")).unwrap();
        h.unlink("a.pdf");

        assert!(h.quiet(Duration::from_millis(100)).await.is_empty());
        assert_eq!(h.registry.snapshot().len(), 1);

        assert_eq!(h.next().await.name(), "deleted");
        assert!(h.registry.snapshot().is_empty());
        assert!(h.quiet(Duration::from_millis(300)).await.is_empty());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_change_supersedes_content() {
        let mut h = Harness::start(100);
        std::fs::write(h.path("a.pdf"), b"one").unwrap();
        h.add("a.pdf");
        let first = match h.next().await {
            LifecycleEvent::Created { document, .. } => document.fingerprint,
            other => panic!("unexpected event {other:?}"),
        };

        std::fs::write(h.path("a.pdf"), b"two").unwrap();
        h.send(RawNotification::Change { path: h.path("a.pdf") });

        match h.next().await {
            LifecycleEvent::Changed { document, previous } => {
                assert_eq!(previous, first);
                assert_ne!(document.fingerprint, first);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.registry.snapshot().len(), 1);
        assert!(h.registry.read().lookup_by_fingerprint(&first).is_none());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_change_for_unknown_path_creates() {
        let mut h = Harness::start(100);
        std::fs::write(h.path("a.pdf"), b"one").unwrap();
        h.send(RawNotification::Change { path: h.path("a.pdf") });
        assert_eq!(h.next().await.name(), "created");
        h.finish().await;
    }

    #[tokio::test]
    async fn test_unmatched_unlink_warns() {
        let mut h = Harness::start(100);
        h.unlink("ghost.pdf");

        match h.next().await {
            LifecycleEvent::Warning { code, path, .. } => {
                assert_eq!(code, WarningCode::UnmatchedUnlink);
                assert_eq!(path, Some(h.path("ghost.pdf")));
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.finish().await;
    }

    #[tokio::test]
    async fn test_vanished_file_aborts_observation() {
        let mut h = Harness::start(100);
        h.add("never-written.pdf");
        assert!(h.quiet(Duration::from_millis(200)).await.is_empty());
        assert!(h.registry.snapshot().is_empty());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_results_applied_in_arrival_order() {
        let mut h = Harness::start(100);
        // A large file hashes slower than the small one behind it.
        std::fs::write(h.path("big.pdf"), vec![1u8; 8 * 1024 * 1024]).unwrap();
        std::fs::write(h.path("small.pdf"), b"x").unwrap();
        h.add("big.pdf");
        h.add("small.pdf");

        let first = h.next().await;
        let second = h.next().await;
        assert_eq!(first.document().unwrap().file_name, "big.pdf");
        assert_eq!(second.document().unwrap().file_name, "small.pdf");
        h.finish().await;
    }

    #[tokio::test]
    async fn test_confirmation_is_idempotent() {
        let mut h = Harness::start(100);
        std::fs::write(h.path("a.pdf"), b"one").unwrap();
        h.add("a.pdf");
        let fingerprint = match h.next().await {
            LifecycleEvent::Created { document, .. } => document.fingerprint,
            other => panic!("unexpected event {other:?}"),
        };

        h.unlink("a.pdf");
        let mark = loop {
            if let Some(mark) = h.registry.read().unlink_mark(&fingerprint) {
                break mark;
            }
            sleep(Duration::from_millis(5)).await;
        };
        let confirm = SessionInput::ConfirmUnlink { fingerprint, path: h.path("a.pdf"), mark };
        h.inbox.as_ref().unwrap().send(confirm.clone()).unwrap();
        h.inbox.as_ref().unwrap().send(confirm).unwrap();

        assert_eq!(h.next().await.name(), "deleted");
        // The scheduled timer fires later and finds nothing.
        assert!(h.quiet(Duration::from_millis(300)).await.is_empty());
        h.finish().await;
    }

    #[tokio::test]
    async fn test_expired_unlink_ignores_replacement_at_same_path() {
        let mut h = Harness::start(400);
        std::fs::write(h.path("a.pdf"), b"first scan").unwrap();
        h.add("a.pdf");
        assert_eq!(h.next().await.name(), "created");

        h.unlink("a.pdf");
        sleep(Duration::from_millis(50)).await;
        std::fs::write(h.path("a.pdf"), b"second scan").unwrap();
        h.add("a.pdf");
        assert_eq!(h.next().await.name(), "changed");

        // Unlinked again before the first timer fires, then restored.
        sleep(Duration::from_millis(250)).await;
        h.unlink("a.pdf");
        sleep(Duration::from_millis(150)).await;
        h.add("a.pdf");

        let rest = h.quiet(Duration::from_millis(700)).await;
        let names: Vec<_> = rest.iter().map(LifecycleEvent::name).collect();
        assert!(names.is_empty(), "unexpected events {names:?}");

        let docs = h.registry.snapshot();
        assert_eq!(docs.len(), 1);
        assert!(!docs[0].pending_unlink);
        h.finish().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_not_observed() {
        let mut h = Harness::start(100);
        let target = TempDir::new().unwrap();
        std::fs::write(target.path().join("real.pdf"), b"elsewhere").unwrap();
        std::os::unix::fs::symlink(target.path().join("real.pdf"), h.path("link.pdf")).unwrap();

        h.add("link.pdf");
        assert!(h.quiet(Duration::from_millis(200)).await.is_empty());
        assert!(h.registry.snapshot().is_empty());
        h.finish().await;
    }
}
