use std::collections::{BTreeSet, HashSet};

use crate::events::VaultEvent;
use crate::filters::SyncFilters;
use crate::index::SyncIndex;

/// Tracks paths awaiting push plus the in-flight syncing set used to
/// suppress event-driven dirtying of the engine's own writes.
///
/// A path leaves the dirty set only when its push (or merged push) has
/// completed; callers persist nothing here, so a crash simply re-derives
/// dirtiness from the next scan.
#[derive(Default)]
pub struct DirtyTracker {
    dirty: BTreeSet<String>,
    syncing: HashSet<String>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_event(&mut self, event: &VaultEvent, index: &SyncIndex, filters: &SyncFilters) {
        match event {
            VaultEvent::Created(p) | VaultEvent::Modified(p) => self.mark_dirty(p, filters),
            VaultEvent::Deleted(p) => self.mark_deleted(p, index),
            VaultEvent::Renamed { from, to } => self.mark_renamed(from, to, index, filters),
            VaultEvent::FolderDeleted(p) => self.mark_folder_deleted(p, index),
            VaultEvent::FolderRenamed { from, to } => {
                self.mark_folder_renamed(from, to, index, filters)
            }
        }
    }

    pub fn mark_dirty(&mut self, path: &str, filters: &SyncFilters) {
        if self.syncing.contains(path) || filters.should_ignore(path, false) {
            return;
        }
        self.dirty.insert(path.to_string());
    }

    /// Deletions only matter for paths the remote knows about. A local
    /// creation deleted before its first sync is a no-op.
    pub fn mark_deleted(&mut self, path: &str, index: &SyncIndex) {
        if self.syncing.contains(path) {
            return;
        }
        if index.contains(path) {
            self.dirty.insert(path.to_string());
        } else {
            self.dirty.remove(path);
        }
    }

    pub fn mark_renamed(
        &mut self,
        old: &str,
        new: &str,
        index: &SyncIndex,
        filters: &SyncFilters,
    ) {
        if self.dirty.contains(old) && !index.contains(old) {
            // Created then renamed before the first sync: the old name never
            // reached the remote.
            self.dirty.remove(old);
        } else {
            self.mark_deleted(old, index);
        }
        self.mark_dirty(new, filters);
    }

    pub fn mark_folder_deleted(&mut self, folder: &str, index: &SyncIndex) {
        for path in index.paths_with_prefix(folder) {
            self.mark_deleted(&path, index);
        }
    }

    pub fn mark_folder_renamed(
        &mut self,
        old_folder: &str,
        new_folder: &str,
        index: &SyncIndex,
        filters: &SyncFilters,
    ) {
        let old_prefix = normalize_prefix(old_folder);
        let new_prefix = normalize_prefix(new_folder);

        for path in index.paths_with_prefix(old_folder) {
            let rest = &path[old_prefix.len()..];
            let new_path = format!("{new_prefix}{rest}");
            self.mark_renamed(&path, &new_path, index, filters);
        }

        // Paths created under the old folder before their first sync.
        let unindexed: Vec<String> = self
            .dirty
            .iter()
            .filter(|p| p.starts_with(&old_prefix) && !index.contains(p))
            .cloned()
            .collect();
        for path in unindexed {
            self.dirty.remove(&path);
            let rest = &path[old_prefix.len()..];
            self.mark_dirty(&format!("{new_prefix}{rest}"), filters);
        }
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.dirty.contains(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Called after a successful push of `path`.
    pub fn clear(&mut self, path: &str) {
        self.dirty.remove(path);
    }

    pub fn begin_syncing(&mut self, path: &str) {
        self.syncing.insert(path.to_string());
    }

    pub fn end_syncing(&mut self, path: &str) {
        self.syncing.remove(path);
    }

    pub fn is_syncing(&self, path: &str) -> bool {
        self.syncing.contains(path)
    }
}

fn normalize_prefix(folder: &str) -> String {
    if folder.ends_with('/') {
        folder.to_string()
    } else {
        format!("{folder}/")
    }
}
