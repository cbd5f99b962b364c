//! Logical documents and their content fingerprints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Hex-encoded SHA-256 digest of a file's bytes
///
/// Stable across renames; changes if and only if the bytes change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines
    ///
    /// Values that are not plain hex and cannot be cut there are returned whole.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scanned file currently or recently known to the watcher
///
/// Owned by the registry; everything handed out to subscribers is a clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub source_path: PathBuf,
    pub fingerprint: Fingerprint,
    pub file_name: String,
    pub origin_directory: PathBuf,
    /// Name of the immediate parent directory
    pub origin_directory_label: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Provisionally removed, waiting for the grace period to confirm
    pub pending_unlink: bool,
}

impl Document {
    /// Build a document from an observed path and its metadata
    pub fn observe(path: &Path, fingerprint: Fingerprint, metadata: &Metadata) -> Self {
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let created = metadata.created().unwrap_or(modified);
        Self::from_parts(path, fingerprint, created.into(), modified.into())
    }

    pub fn from_parts(
        path: &Path,
        fingerprint: Fingerprint,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let origin_directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let origin_directory_label = origin_directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            source_path: path.to_path_buf(),
            fingerprint,
            file_name,
            origin_directory,
            origin_directory_label,
            created_at,
            modified_at,
            pending_unlink: false,
        }
    }

    /// The earlier of the creation and modification timestamps
    pub fn earliest_timestamp(&self) -> DateTime<Utc> {
        self.created_at.min(self.modified_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_document_path_metadata() {
        let at = Utc.with_ymd_and_hms(2024, 4, 27, 8, 53, 0).unwrap();
        let doc = Document::from_parts(
            Path::new("/mnt/fax/2F_C2230/scan001.pdf"),
            Fingerprint::new("ab"),
            at,
            at,
        );

        assert_eq!(doc.file_name, "scan001.pdf");
        assert_eq!(doc.origin_directory, PathBuf::from("/mnt/fax/2F_C2230"));
        assert_eq!(doc.origin_directory_label, "2F_C2230");
        assert!(!doc.pending_unlink);
    }

    #[test]
    fn test_earliest_timestamp() {
        let created = Utc.with_ymd_and_hms(2024, 4, 27, 9, 0, 0).unwrap();
        let modified = Utc.with_ymd_and_hms(2024, 4, 27, 8, 0, 0).unwrap();
        let doc = Document::from_parts(Path::new("/a/b.pdf"), Fingerprint::new("ab"), created, modified);
        assert_eq!(doc.earliest_timestamp(), modified);
    }

    #[test]
    fn test_fingerprint_short() {
        let fp = Fingerprint::new("0123456789abcdef0123");
        assert_eq!(fp.short(), "0123456789ab");
        assert_eq!(Fingerprint::new("abc").short(), "abc");
    }

    #[test]
    fn test_fingerprint_short_non_ascii() {
        let fp = Fingerprint::new("aéééééééé");
        assert_eq!(fp.short(), "aéééééééé");
        assert_eq!(Fingerprint::new("éééééééé").short(), "éééééé");
    }
}
