use crate::index::{IndexEntry, LastAction};
use crate::remote::CloudFile;
use crate::vfs::FileStat;

/// Normalized view of the remote side of one path, whether it came from
/// live cloud metadata or from a downloaded remote index document.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteState {
    pub file_id: String,
    pub hash: Option<String>,
    pub mtime: i64,
    pub size: u64,
}

impl RemoteState {
    pub fn from_cloud(file: &CloudFile) -> Self {
        Self {
            file_id: file.id.clone(),
            hash: file.hash.clone(),
            mtime: file.mtime,
            size: file.size,
        }
    }

    pub fn from_remote_entry(entry: &IndexEntry) -> Self {
        Self {
            file_id: entry.file_id.clone(),
            hash: Some(entry.hash.clone()),
            mtime: entry.mtime,
            size: entry.size,
        }
    }
}

/// What to do about one path. Evaluated in order; first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Nothing to do.
    Skip,
    /// Both sides gone; drop the stale index entry.
    PruneEntry,
    Pull,
    Push,
    /// Remote deleted a file we had synced; move the local copy to trash.
    DeleteLocal,
    /// Content already equal on both sides with no prior entry; record it
    /// without any transfer.
    AdoptEntry,
    /// Shared content, stale metadata; refresh mtime/size without transfer.
    RefreshEntry,
    /// Both sides diverged from the last shared state.
    Resolve,
}

/// The per-path decision table.
///
/// `local_disk_hash` is the hash of the bytes currently on disk, supplied
/// only when the caller had to compute it; `None` means "not computed",
/// which is treated as unknown rather than absent.
pub fn decide(
    local: Option<&FileStat>,
    entry: Option<&IndexEntry>,
    remote: Option<&RemoteState>,
    local_disk_hash: Option<&str>,
) -> SyncDecision {
    match (local, remote) {
        (None, None) => {
            if entry.is_some() {
                SyncDecision::PruneEntry
            } else {
                SyncDecision::Skip
            }
        }
        (None, Some(_)) => SyncDecision::Pull,
        (Some(_), None) => {
            if entry.is_some() {
                SyncDecision::DeleteLocal
            } else {
                SyncDecision::Push
            }
        }
        (Some(local), Some(remote)) => match entry {
            None => {
                // Adoption probe: no prior knowledge of this path.
                if matches!((local_disk_hash, remote.hash.as_deref()), (Some(l), Some(r)) if l == r)
                {
                    SyncDecision::AdoptEntry
                } else {
                    // Bytes differ and we have no history: remote wins.
                    SyncDecision::Pull
                }
            }
            Some(entry) => {
                if remote_matches_entry(remote, entry) {
                    if local_disk_hash.is_some() && local_disk_hash != Some(entry.hash.as_str()) {
                        // Local edit the event stream missed.
                        SyncDecision::Push
                    } else if confirmation_pending(entry)
                        || remote.mtime != entry.mtime
                        || !sizes_match(remote.size, entry.size)
                    {
                        SyncDecision::RefreshEntry
                    } else {
                        SyncDecision::Skip
                    }
                } else {
                    let local_clean = match local_disk_hash {
                        Some(h) => h == entry.hash,
                        None => true,
                    };
                    if local_clean && entry.last_action == LastAction::Pull {
                        // Only the remote moved.
                        SyncDecision::Pull
                    } else {
                        // Either the disk diverged too, or our last action
                        // authored content the remote no longer carries
                        // (stale-pull guard): never overwrite blindly.
                        SyncDecision::Resolve
                    }
                }
            }
        },
    }
}

/// A hash match between the entry and the remote is a sync confirmation:
/// it licenses advancing `ancestor_hash` to the shared hash and settling
/// `last_action` back to `pull`.
fn confirmation_pending(entry: &IndexEntry) -> bool {
    entry.ancestor_hash.as_deref() != Some(entry.hash.as_str())
        || entry.last_action != LastAction::Pull
}

fn remote_matches_entry(remote: &RemoteState, entry: &IndexEntry) -> bool {
    match remote.hash.as_deref() {
        Some(hash) => hash == entry.hash,
        // Hashless remotes: fall back to metadata equality.
        None => sizes_match(remote.size, entry.size) && remote.mtime == entry.mtime,
    }
}

/// Size equality with the stat-unreliability escape hatch: a zero on
/// either side is not evidence of difference.
fn sizes_match(a: u64, b: u64) -> bool {
    a == 0 || b == 0 || a == b
}
