//! One instance of the directory-watch primitive
//!
//! A session registers a non-recursive `notify` watch on every configured
//! source, seeds itself with the files already present, settles writes and
//! hands the resulting notifications to a [`Resolver`]. Errors from the
//! primitive are classified and forwarded to the supervisor; the session
//! never tries to recover locally.

use crate::archive::ArchivalCopier;
use crate::config::WatcherConfig;
use crate::error::Result;
use crate::events::LifecycleEventBus;
use crate::monitor::resolver::{Resolver, SessionInput};
use crate::monitor::settle::{WriteKind, WriteSettler};
use crate::monitor::{DocumentFilter, FailureCode, RawNotification, WatchFailure};
use crate::registry::SharedRegistry;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

/// Everything a session needs from its owner
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub config: Arc<WatcherConfig>,
    pub registry: SharedRegistry,
    pub bus: LifecycleEventBus,
    /// Mark files found by the initial scan as resynchronised
    pub resync: bool,
}

/// A live watch over all configured sources
pub struct WatchSession {
    watcher: Option<RecommendedWatcher>,
    pump: JoinHandle<()>,
    resolver: JoinHandle<()>,
}

impl std::fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("watching", &self.watcher.is_some())
            .field("pump_finished", &self.pump.is_finished())
            .finish()
    }
}

impl WatchSession {
    /// Start watching; returns once the primitive has accepted every source
    pub fn start(ctx: SessionContext, failures: mpsc::UnboundedSender<WatchFailure>) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Receiver gone means the session is closing.
                let _ = raw_tx.send(res);
            },
            NotifyConfig::default().with_follow_symlinks(false),
        )?;

        for source in &ctx.config.sources {
            watcher.watch(&source.path, RecursiveMode::NonRecursive)?;
            info!("Watching {:?} (label: {})", source.path, source.label.as_deref().unwrap_or("-"));
        }

        let filter = DocumentFilter::new(&ctx.config.extension);
        let mut settler = WriteSettler::new(ctx.config.timing.settle());
        let roots: Vec<PathBuf> = ctx.config.sources.iter().map(|s| s.path.clone()).collect();
        let found = initial_scan(&roots, &filter, &mut settler, ctx.resync);
        debug!("Initial scan found {} documents", found);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let copier = ctx.config.archive_dir.as_ref().map(ArchivalCopier::new);
        let resolver = Resolver::new(
            Arc::clone(&ctx.config),
            ctx.registry.clone(),
            ctx.bus.clone(),
            copier,
            input_tx.downgrade(),
        );
        let resolver = tokio::spawn(resolver.run(input_rx));

        let router = Router { filter, roots, settler, input: input_tx, failures };
        let pump = tokio::spawn(router.pump(raw_rx, ctx.config.timing.settle_poll()));

        Ok(Self { watcher: Some(watcher), pump, resolver })
    }

    /// Stop the primitive and every task belonging to this session
    ///
    /// Grace-period timers still pending afterwards find no resolver and do
    /// nothing.
    pub async fn close(mut self) {
        drop(self.watcher.take());
        self.pump.abort();
        self.resolver.abort();
        let _ = (&mut self.pump).await;
        let _ = (&mut self.resolver).await;
        debug!("Watch session closed");
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.pump.abort();
        self.resolver.abort();
    }
}

/// Queue every accepted file already present in the sources
fn initial_scan(roots: &[PathBuf], filter: &DocumentFilter, settler: &mut WriteSettler, resync: bool) -> usize {
    let mut found = 0;
    for root in roots {
        let walker = WalkDir::new(root).min_depth(1).max_depth(1).follow_links(false);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Initial scan of {:?} failed: {}", root, e);
                    continue;
                }
            };
            if entry.file_type().is_file() && filter.accepts(entry.path()) {
                settler.observe(entry.into_path(), WriteKind::Add { resync });
                found += 1;
            }
        }
    }
    found
}

/// Routes raw primitive events into the settler, the resolver or the supervisor
struct Router {
    filter: DocumentFilter,
    roots: Vec<PathBuf>,
    settler: WriteSettler,
    input: mpsc::UnboundedSender<SessionInput>,
    failures: mpsc::UnboundedSender<WatchFailure>,
}

impl Router {
    async fn pump(
        mut self,
        mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
        poll: std::time::Duration,
    ) {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = raw.recv() => match event {
                    Some(Ok(event)) => self.route(event),
                    Some(Err(err)) => {
                        error!("Watch error: {}", err);
                        if self.failures.send(WatchFailure::from(&err)).is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = self.failures.send(WatchFailure::new(
                            FailureCode::WatchClosed,
                            "watch primitive stopped delivering events",
                        ));
                        break;
                    }
                },
                _ = ticker.tick() => {
                    for notification in self.settler.take_ready() {
                        if self.input.send(SessionInput::Notify(notification)).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn route(&mut self, event: Event) {
        trace!("Raw event {:?} {:?}", event.kind, event.paths);
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    self.added(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
                (RenameMode::From, [from, ..]) => self.removed(from.clone()),
                (RenameMode::To, [to, ..]) => self.added(to.clone()),
                // Backends that pair renames also report both halves on their own.
                (RenameMode::Both, [_, to, ..]) => self.added(to.clone()),
                _ => {
                    for path in event.paths {
                        if path.exists() {
                            self.added(path);
                        } else {
                            self.removed(path);
                        }
                    }
                }
            },
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.changed(path);
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.removed(path);
                }
            }
            _ => {}
        }
    }

    fn added(&mut self, path: PathBuf) {
        if self.filter.accepts(&path) {
            self.settler.observe(path, WriteKind::Add { resync: false });
        }
    }

    fn changed(&mut self, path: PathBuf) {
        if self.filter.accepts(&path) {
            self.settler.observe(path, WriteKind::Change);
        }
    }

    fn removed(&mut self, path: PathBuf) {
        if self.is_root(&path) {
            warn!("Watched source {:?} was removed", path);
            let _ = self.failures.send(WatchFailure::new(
                FailureCode::SourceUnreachable,
                format!("watched source {} was removed", path.display()),
            ));
            return;
        }
        if !self.filter.accepts(&path) {
            return;
        }
        // A pending write may have replaced a tracked document, so the
        // resolver still has to see the unlink.
        if self.settler.cancel(&path).is_some() {
            debug!("{:?} removed before it settled", path);
        }
        let _ = self.input.send(SessionInput::Notify(RawNotification::Unlink { path }));
    }

    fn is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| root == path)
    }
}
