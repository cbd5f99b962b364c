//! Watch supervision and connectivity recovery
//!
//! The supervisor owns the registry and the event bus for the lifetime of
//! the process and replaces the [`WatchSession`] whenever the primitive
//! reports a connectivity-class failure. Recovery discards all identity
//! state; the next session's initial scan re-seeds it.

use crate::config::{WatchedSource, WatcherConfig};
use crate::document::Document;
use crate::error::{Result, WatchError};
use crate::events::{LifecycleEvent, LifecycleEventBus};
use crate::monitor::session::{SessionContext, WatchSession};
use crate::monitor::{FailureCode, WatchFailure};
use crate::registry::SharedRegistry;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, error, info, warn};

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum WatcherState {
    /// Waiting for sources to become reachable and the watch to start
    Connecting,
    Active,
    /// Tearing down after a connectivity failure
    Recovering(FailureCode),
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherState::Connecting => f.write_str("connecting"),
            WatcherState::Active => f.write_str("active"),
            WatcherState::Recovering(code) => write!(f, "recovering ({code})"),
            WatcherState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Coalesces repeated failure codes
///
/// Only a change of code counts as a transition; the same code reported
/// again while already failed is ignored.
#[derive(Debug, Default)]
pub struct FailureTracker {
    current: Option<FailureCode>,
}

impl FailureTracker {
    /// Record a failure; true if it differs from the current one
    pub fn observe(&mut self, code: FailureCode) -> bool {
        if self.current == Some(code) {
            return false;
        }
        self.current = Some(code);
        true
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<FailureCode> {
        self.current
    }
}

enum SessionEnd {
    Shutdown,
    Failed(FailureCode),
}

/// Long-lived watcher that survives source outages
pub struct ResilientWatcher {
    config: Arc<WatcherConfig>,
    registry: SharedRegistry,
    bus: LifecycleEventBus,
    state: watch::Sender<WatcherState>,
    #[cfg(test)]
    session_failures: std::sync::Mutex<Option<mpsc::WeakUnboundedSender<WatchFailure>>>,
}

impl fmt::Debug for ResilientWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientWatcher")
            .field("sources", &self.config.sources.len())
            .field("state", &self.state())
            .field("documents", &self.registry.read().len())
            .finish()
    }
}

impl ResilientWatcher {
    /// Create a watcher; nothing is watched until [`run`](Self::run)
    pub fn new(config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        let bus = LifecycleEventBus::new(config.event_capacity);
        let (state, _) = watch::channel(WatcherState::Connecting);
        Ok(Self {
            config: Arc::new(config),
            registry: SharedRegistry::new(),
            bus,
            state,
            #[cfg(test)]
            session_failures: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn sources(&self) -> &[WatchedSource] {
        &self.config.sources
    }

    pub fn bus(&self) -> &LifecycleEventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    /// Snapshot of every known document, oldest first
    pub fn get_all_fax(&self) -> Vec<Document> {
        self.registry.snapshot()
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Run on a background task until the returned handle shuts it down
    pub fn spawn(self: Arc<Self>) -> WatcherHandle {
        let (shutdown, rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { self.run(rx).await });
        WatcherHandle { shutdown, task }
    }

    /// Supervise sessions until `shutdown` fires or its sender is dropped
    ///
    /// Never returns early on filesystem or network trouble; unreachable
    /// sources are retried indefinitely.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        self.prepare_archive_dir().await;

        let mut tracker = FailureTracker::default();
        let mut resync = false;

        loop {
            self.set_state(WatcherState::Connecting);
            if !self.wait_until_reachable(&mut tracker, &mut shutdown).await {
                break;
            }

            let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
            #[cfg(test)]
            self.hold_session_failures(&failure_tx);
            let ctx = SessionContext {
                config: Arc::clone(&self.config),
                registry: self.registry.clone(),
                bus: self.bus.clone(),
                resync,
            };
            let session = match WatchSession::start(ctx, failure_tx) {
                Ok(session) => session,
                Err(e) => {
                    let code = match &e {
                        WatchError::Notify(err) => FailureCode::from_notify(err),
                        _ => FailureCode::Other,
                    };
                    if tracker.observe(code) {
                        error!("Failed to start watch session: {}", e);
                        self.publish_failure(&WatchFailure::new(code, e.to_string()));
                    }
                    if self.pause(self.config.timing.reconnect_backoff(), &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(WatcherState::Active);
            tracker.reset();

            let end = self.supervise(&mut failure_rx, &mut tracker, &mut shutdown).await;
            session.close().await;

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(code) => {
                    self.set_state(WatcherState::Recovering(code));
                    let discarded = {
                        let mut registry = self.registry.write();
                        let count = registry.len();
                        registry.clear();
                        count
                    };
                    warn!("Connectivity lost ({}), discarded {} documents", code, discarded);
                    resync = true;
                }
            }
        }

        self.set_state(WatcherState::Stopped);
        info!("Watcher stopped");
    }

    /// Wait for session failures, probing source reachability meanwhile
    async fn supervise(
        &self,
        failures: &mut mpsc::UnboundedReceiver<WatchFailure>,
        tracker: &mut FailureTracker,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> SessionEnd {
        let period = self.config.timing.health_check();
        let mut probe = interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return SessionEnd::Shutdown,
                failure = failures.recv() => {
                    let failure = failure.unwrap_or_else(|| {
                        WatchFailure::new(FailureCode::WatchClosed, "watch session ended unexpectedly")
                    });
                    if !failure.code.is_connectivity() {
                        warn!("Non-fatal watch error ({}): {}", failure.code, failure.message);
                        self.publish_failure(&failure);
                        continue;
                    }
                    if tracker.observe(failure.code) {
                        error!("{}: {}", WatchError::Connectivity { code: failure.code }, failure.message);
                        self.publish_failure(&failure);
                        return SessionEnd::Failed(failure.code);
                    }
                    debug!("Coalesced repeated failure {}", failure.code);
                }
                _ = probe.tick() => {
                    let missing = self.config.unreachable_sources();
                    if missing.is_empty() {
                        continue;
                    }
                    let code = FailureCode::SourceUnreachable;
                    if tracker.observe(code) {
                        let failure = WatchFailure::new(code, describe_missing(&missing));
                        error!("{}: {}", WatchError::Connectivity { code }, failure.message);
                        self.publish_failure(&failure);
                        return SessionEnd::Failed(code);
                    }
                }
            }
        }
    }

    /// Block until every source is reachable; false if shut down meanwhile
    async fn wait_until_reachable(
        &self,
        tracker: &mut FailureTracker,
        shutdown: &mut mpsc::Receiver<()>,
    ) -> bool {
        loop {
            let missing = self.config.unreachable_sources();
            if missing.is_empty() {
                return true;
            }

            let message = describe_missing(&missing);
            if tracker.observe(FailureCode::SourceUnreachable) {
                warn!("Sources unreachable, retrying every {:?}: {}", self.config.timing.reconnect_backoff(), message);
                self.publish_failure(&WatchFailure::new(FailureCode::SourceUnreachable, message));
            } else {
                debug!("Still unreachable: {}", message);
            }

            if self.pause(self.config.timing.reconnect_backoff(), shutdown).await {
                return false;
            }
            info!("Re-checking source reachability");
        }
    }

    /// Sleep for `duration`; true if shutdown was requested instead
    async fn pause(&self, duration: Duration, shutdown: &mut mpsc::Receiver<()>) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            _ = shutdown.recv() => true,
        }
    }

    async fn prepare_archive_dir(&self) {
        if let Some(dir) = &self.config.archive_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Could not create archive directory {:?}: {} (continuing anyway)", dir, e);
            }
        }
    }

    fn publish_failure(&self, failure: &WatchFailure) {
        self.bus.publish(LifecycleEvent::Error { code: failure.code, message: failure.message.clone() });
    }

    fn set_state(&self, state: WatcherState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Watcher state: {} -> {}", previous, state);
        }
    }

    #[cfg(test)]
    fn hold_session_failures(&self, failures: &mpsc::UnboundedSender<WatchFailure>) {
        let mut slot = self.session_failures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(failures.downgrade());
    }

    /// Report a failure as if the current session's primitive had raised it
    #[cfg(test)]
    pub(crate) fn inject_failure(&self, failure: WatchFailure) -> bool {
        let sender = self
            .session_failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .and_then(mpsc::WeakUnboundedSender::upgrade);
        sender.is_some_and(|tx| tx.send(failure).is_ok())
    }
}

fn describe_missing(missing: &[&WatchedSource]) -> String {
    let paths: Vec<String> = missing.iter().map(|s| s.path.display().to_string()).collect();
    format!("unreachable: {}", paths.join(", "))
}

/// Handle to a watcher running on a background task
#[derive(Debug)]
pub struct WatcherHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Close the watch primitive and wait for the supervisor to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.task.await {
            error!("Watcher task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn watcher_for(dir: &TempDir) -> ResilientWatcher {
        let mut config = WatcherConfig::new(vec![WatchedSource::new(dir.path())]);
        config.timing.health_check_ms = 50;
        ResilientWatcher::new(config).unwrap()
    }

    fn error_codes(events: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<FailureCode> {
        let mut codes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LifecycleEvent::Error { code, .. } = event {
                codes.push(code);
            }
        }
        codes
    }

    #[test]
    fn test_tracker_coalesces_repeated_codes() {
        let mut tracker = FailureTracker::default();
        assert!(tracker.observe(FailureCode::ConnectionReset));
        assert!(!tracker.observe(FailureCode::ConnectionReset));
        assert!(tracker.observe(FailureCode::NetworkUnreachable));
        assert_eq!(tracker.current(), Some(FailureCode::NetworkUnreachable));

        tracker.reset();
        assert!(tracker.observe(FailureCode::NetworkUnreachable));
    }

    #[tokio::test]
    async fn test_supervise_classifies_failures() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_for(&dir);
        let mut events = watcher.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, mut shutdown) = mpsc::channel(1);

        let mut tracker = FailureTracker::default();
        tracker.observe(FailureCode::ConnectionReset);
        tx.send(WatchFailure::new(FailureCode::ConnectionReset, "reset again")).unwrap();
        tx.send(WatchFailure::new(FailureCode::PermissionDenied, "denied")).unwrap();
        tx.send(WatchFailure::new(FailureCode::NetworkUnreachable, "network down")).unwrap();

        let end = timeout(Duration::from_secs(5), watcher.supervise(&mut rx, &mut tracker, &mut shutdown))
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::Failed(FailureCode::NetworkUnreachable)));
        // The repeated reset is coalesced; the permission error is published but not fatal.
        assert_eq!(
            error_codes(&mut events),
            vec![FailureCode::PermissionDenied, FailureCode::NetworkUnreachable]
        );
        assert_eq!(tracker.current(), Some(FailureCode::NetworkUnreachable));
    }

    #[tokio::test]
    async fn test_supervise_treats_closed_channel_as_failure() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_for(&dir);
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchFailure>();
        let (_shutdown_tx, mut shutdown) = mpsc::channel(1);
        drop(tx);

        let mut tracker = FailureTracker::default();
        let end = timeout(Duration::from_secs(5), watcher.supervise(&mut rx, &mut tracker, &mut shutdown))
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::Failed(FailureCode::WatchClosed)));
    }

    #[tokio::test]
    async fn test_supervise_detects_missing_source() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_for(&dir);
        let mut events = watcher.subscribe();
        let (_tx, mut rx) = mpsc::unbounded_channel::<WatchFailure>();
        let (_shutdown_tx, mut shutdown) = mpsc::channel(1);
        std::fs::remove_dir(dir.path()).unwrap();

        let mut tracker = FailureTracker::default();
        let end = timeout(Duration::from_secs(5), watcher.supervise(&mut rx, &mut tracker, &mut shutdown))
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::Failed(FailureCode::SourceUnreachable)));
        assert_eq!(error_codes(&mut events), vec![FailureCode::SourceUnreachable]);
    }

    #[tokio::test]
    async fn test_supervise_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher_for(&dir);
        let (_tx, mut rx) = mpsc::unbounded_channel::<WatchFailure>();
        let (shutdown_tx, mut shutdown) = mpsc::channel(1);
        shutdown_tx.send(()).await.unwrap();

        let mut tracker = FailureTracker::default();
        let end = timeout(Duration::from_secs(5), watcher.supervise(&mut rx, &mut tracker, &mut shutdown))
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::Shutdown));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        assert!(ResilientWatcher::new(WatcherConfig::new(Vec::new())).is_err());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(WatcherState::Recovering(FailureCode::ConnectionReset)).unwrap();
        assert_eq!(json["state"], "recovering");
        assert_eq!(json["code"], "CONNECTION_RESET");
        assert_eq!(serde_json::to_value(WatcherState::Active).unwrap()["state"], "active");
    }
}
