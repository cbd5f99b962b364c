//! In-memory document registry
//!
//! Maintains two indices over the same set of documents: fingerprint to
//! document, and current source path to fingerprint. Every mutation updates
//! both before returning, so no caller ever observes them disagreeing.

use crate::document::{Document, Fingerprint};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

struct Entry {
    /// Insertion sequence, kept when the entry is replaced in place
    seq: u64,
    /// Set by the unlink currently waiting to be confirmed, if any
    unlink: Option<UnlinkMark>,
    document: Document,
}

/// Identifies one provisional unlink
///
/// A confirmation only finalizes the document that still carries the mark
/// it was scheduled with; any later observation or unlink replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnlinkMark(u64);

/// Bidirectional index of known documents
///
/// The registry does no locking of its own; see [`SharedRegistry`].
#[derive(Default)]
pub struct DocumentRegistry {
    by_fingerprint: HashMap<Fingerprint, Entry>,
    by_path: HashMap<PathBuf, Fingerprint>,
    next_seq: u64,
    next_mark: u64,
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("documents", &self.by_fingerprint.len())
            .field("paths", &self.by_path.len())
            .finish()
    }
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the document stored under `fingerprint`
    ///
    /// The path index is re-pointed at `document.source_path`. If that path
    /// belonged to a different fingerprint, the stale document is removed
    /// and returned so the caller can report it.
    pub fn upsert_by_fingerprint(
        &mut self,
        fingerprint: Fingerprint,
        mut document: Document,
    ) -> Option<Document> {
        document.fingerprint = fingerprint.clone();
        let path = document.source_path.clone();

        let displaced = match self.by_path.get(&path) {
            Some(owner) if *owner != fingerprint => {
                let owner = owner.clone();
                self.remove(&owner)
            }
            _ => None,
        };

        let seq = match self.by_fingerprint.get(&fingerprint) {
            Some(existing) => {
                if existing.document.source_path != path {
                    self.by_path.remove(&existing.document.source_path);
                }
                existing.seq
            }
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };

        trace!("Registry upsert {} at {:?}", fingerprint.short(), path);
        self.by_path.insert(path, fingerprint.clone());
        self.by_fingerprint.insert(fingerprint, Entry { seq, unlink: None, document });
        displaced
    }

    pub fn lookup_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&Document> {
        self.by_fingerprint.get(fingerprint).map(|e| &e.document)
    }

    pub fn lookup_by_path(&self, path: &Path) -> Option<&Document> {
        self.by_path.get(path).and_then(|fp| self.lookup_by_fingerprint(fp))
    }

    /// Flag a document as provisionally removed
    ///
    /// Returns the mark a later confirmation must present, or `None` if the
    /// fingerprint is unknown. Re-marking supersedes the previous mark.
    pub fn mark_pending_unlink(&mut self, fingerprint: &Fingerprint) -> Option<UnlinkMark> {
        let entry = self.by_fingerprint.get_mut(fingerprint)?;
        self.next_mark += 1;
        let mark = UnlinkMark(self.next_mark);
        entry.unlink = Some(mark);
        entry.document.pending_unlink = true;
        Some(mark)
    }

    /// The mark of the unlink pending on a document, if any
    pub fn unlink_mark(&self, fingerprint: &Fingerprint) -> Option<UnlinkMark> {
        self.by_fingerprint.get(fingerprint).and_then(|e| e.unlink)
    }

    /// Finalize a provisional unlink
    ///
    /// The document is looked up by fingerprint, then by its last known path
    /// in case it was re-keyed meanwhile. It is removed only while it still
    /// carries `mark`; otherwise this is a no-op.
    pub fn confirm_unlink(
        &mut self,
        fingerprint: &Fingerprint,
        path: &Path,
        mark: UnlinkMark,
    ) -> Option<Document> {
        let owner = if self.by_fingerprint.contains_key(fingerprint) {
            fingerprint.clone()
        } else {
            self.by_path.get(path)?.clone()
        };
        let marked = self.by_fingerprint.get(&owner).is_some_and(|e| e.unlink == Some(mark));
        if !marked {
            return None;
        }
        self.remove(&owner)
    }

    /// Remove the document and its path entry; absent fingerprints are a no-op
    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Document> {
        let entry = self.by_fingerprint.remove(fingerprint)?;
        if self.by_path.get(&entry.document.source_path) == Some(fingerprint) {
            self.by_path.remove(&entry.document.source_path);
        }
        trace!("Registry remove {}", fingerprint.short());
        Some(entry.document)
    }

    /// All documents, oldest-observed first
    pub fn snapshot(&self) -> Vec<Document> {
        let mut entries: Vec<&Entry> = self.by_fingerprint.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.document.clone()).collect()
    }

    /// Discard all identity state
    pub fn clear(&mut self) {
        self.by_fingerprint.clear();
        self.by_path.clear();
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}

/// Registry handle shared between the resolver, the supervisor and queries
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry {
    inner: Arc<RwLock<DocumentRegistry>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry mutations never panic midway, so a poisoned lock still holds
    /// consistent indices.
    pub fn read(&self) -> RwLockReadGuard<'_, DocumentRegistry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DocumentRegistry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Vec<Document> {
        self.read().snapshot()
    }
}
