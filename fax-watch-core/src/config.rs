//! Watcher configuration
//!
//! Loaded from a TOML file. Sources may be listed either as plain paths or
//! as tables carrying device metadata.

use crate::error::WatchError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One configured directory to monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SourceEntry")]
pub struct WatchedSource {
    /// Numeric device id, forwarded to subscribers as-is
    pub id: Option<u32>,
    /// Device name, e.g. "Canon C2230"
    pub name: Option<String>,
    /// Human-readable location tag, e.g. "2F"
    pub label: Option<String>,
    pub path: PathBuf,
}

impl WatchedSource {
    /// Create a source with no device metadata
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { id: None, name: None, label: None, path: path.into() }
    }

    /// Attach a location label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether the directory currently exists and is accessible
    pub fn is_reachable(&self) -> bool {
        fs::metadata(&self.path).map(|m| m.is_dir()).unwrap_or(false)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceEntry {
    Path(PathBuf),
    Detailed {
        #[serde(default)]
        id: Option<u32>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        label: Option<String>,
        path: PathBuf,
    },
}

impl From<SourceEntry> for WatchedSource {
    fn from(entry: SourceEntry) -> Self {
        match entry {
            SourceEntry::Path(path) => WatchedSource::new(path),
            SourceEntry::Detailed { id, name, label, path } => {
                WatchedSource { id, name, label, path }
            }
        }
    }
}

/// Timing knobs, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Quiet period a file must observe before `add`/`change` fire
    pub settle_ms: u64,
    /// How often pending writes are re-checked
    pub settle_poll_ms: u64,
    /// Delay before an unlink is confirmed as a deletion
    pub grace_period_ms: u64,
    /// Wait between reachability checks while sources are unreachable
    pub reconnect_backoff_ms: u64,
    /// Reachability check interval while a session is active
    pub health_check_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 5000,
            settle_poll_ms: 1000,
            grace_period_ms: 6000,
            reconnect_backoff_ms: 10_000,
            health_check_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }
}

/// Subscriber feed settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Listen address; the feed is disabled when unset
    pub bind: Option<SocketAddr>,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub sources: Vec<WatchedSource>,

    /// Archive directory; archival copies are skipped when unset
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    /// Accepted document extension, without the dot
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Buffered events per subscriber before it starts lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub feed: FeedConfig,
}

fn default_extension() -> String {
    "pdf".to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl WatcherConfig {
    /// Create a configuration with default timings for the given sources
    pub fn new(sources: Vec<WatchedSource>) -> Self {
        Self {
            sources,
            archive_dir: None,
            extension: default_extension(),
            event_capacity: default_event_capacity(),
            timing: TimingConfig::default(),
            feed: FeedConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> std::result::Result<(), WatchError> {
        if self.sources.is_empty() {
            return Err(WatchError::configuration("at least one source is required"));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(WatchError::configuration("document extension must not be empty"));
        }
        if self.event_capacity == 0 {
            return Err(WatchError::configuration("event_capacity must be positive"));
        }
        let timing = &self.timing;
        let durations = [
            ("settle_poll_ms", timing.settle_poll_ms),
            ("grace_period_ms", timing.grace_period_ms),
            ("reconnect_backoff_ms", timing.reconnect_backoff_ms),
            ("health_check_ms", timing.health_check_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(WatchError::configuration(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Find the source that owns a directory
    pub fn source_for_dir(&self, dir: &Path) -> Option<&WatchedSource> {
        self.sources.iter().find(|s| s.path == dir)
    }

    /// Sources whose directory is currently missing or inaccessible
    pub fn unreachable_sources(&self) -> Vec<&WatchedSource> {
        self.sources.iter().filter(|s| !s.is_reachable()).collect()
    }
}

/// Sample configuration written by `fax-watch init`
pub const SAMPLE_CONFIG: &str = r#"# fax-watch configuration

# Newly arrived documents are copied here; remove to disable archival.
archive_dir = "/srv/fax/archive"

# Only files with this extension are tracked.
extension = "pdf"

[timing]
settle_ms = 5000
settle_poll_ms = 1000
grace_period_ms = 6000
reconnect_backoff_ms = 10000
health_check_ms = 10000

[feed]
bind = "0.0.0.0:8470"

[[sources]]
id = 1
name = "Canon C2230"
label = "2F"
path = "/mnt/fax/2F_C2230"

[[sources]]
id = 2
name = "Muratec C3090"
label = "4F"
path = "/mnt/fax/4F_C3090"
"#;
