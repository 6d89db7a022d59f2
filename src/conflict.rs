use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::md5_hex;
use crate::dirty::DirtyTracker;
use crate::filters::SyncFilters;
use crate::history::RevisionLog;
use crate::index::{IndexEntry, LastAction, SyncIndex};
use crate::merge::{three_way_merge, MergeOutcome};
use crate::remote::{CloudFile, Remote};
use crate::vault_lock::CipherBoundary;
use crate::vfs::Vfs;

/// Upper bound on the newest-to-oldest revision walk during ancestor
/// discovery.
pub const ANCESTOR_WALK_LIMIT: usize = 32;

/// Cross-device merge lease horizon.
pub const MERGE_LEASE_MS: i64 = 5 * 60 * 1000;

/// Remote-only coordination file announcing in-flight merges.
pub const COMMUNICATION_PATH: &str = ".vaultsync/communication.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    SmartMerge,
    AlwaysFork,
    ForceLocal,
    ForceRemote,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::SmartMerge
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "smart-merge" => Ok(ConflictStrategy::SmartMerge),
            "always-fork" => Ok(ConflictStrategy::AlwaysFork),
            "force-local" => Ok(ConflictStrategy::ForceLocal),
            "force-remote" => Ok(ConflictStrategy::ForceRemote),
            other => anyhow::bail!("unknown conflict strategy: {other}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MergeAnnouncement {
    device: String,
    path: String,
    #[serde(rename = "startedAt")]
    started_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommunicationDoc {
    merges: Vec<MergeAnnouncement>,
}

/// How a divergence was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Line-merged; merged bytes are on disk and dirty for push.
    Merged,
    /// Remote kept canonical, local preserved as the named sibling.
    Forked { sibling: String },
    ForcedLocal,
    ForcedRemote,
    /// Local never diverged from the base: plain pull.
    Pulled,
    /// Remote never diverged from the base: local stays dirty for push.
    LocalAhead,
    /// Another device holds a fresh merge lease on this path.
    Deferred,
}

/// Resolves divergent files. Push-time and pull-time conflicts both land
/// here; the caller has already decided the path diverged.
pub struct Resolver {
    pub strategy: ConflictStrategy,
    pub device_id: String,
}

impl Resolver {
    pub fn new(strategy: ConflictStrategy, device_id: &str) -> Self {
        Self {
            strategy,
            device_id: device_id.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        &self,
        path: &str,
        remote_file: &CloudFile,
        vfs: &dyn Vfs,
        remote: &Remote,
        history: &RevisionLog,
        index: &mut SyncIndex,
        dirty: &mut DirtyTracker,
        filters: &SyncFilters,
        cipher: &CipherBoundary,
    ) -> Result<Resolution> {
        if self.lease_held_elsewhere(path, remote).await? {
            return Ok(Resolution::Deferred);
        }
        self.announce_merge(path, remote).await;

        let result = self
            .resolve_inner(path, remote_file, vfs, remote, history, index, dirty, filters, cipher)
            .await;

        self.withdraw_merge(path, remote).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_inner(
        &self,
        path: &str,
        remote_file: &CloudFile,
        vfs: &dyn Vfs,
        remote: &Remote,
        history: &RevisionLog,
        index: &mut SyncIndex,
        dirty: &mut DirtyTracker,
        filters: &SyncFilters,
        cipher: &CipherBoundary,
    ) -> Result<Resolution> {
        let local_bytes = vfs
            .read(path)
            .await
            .with_context(|| format!("read local side of {path}"))?;
        let stored_remote = remote.adapter.download_file(&remote_file.id).await?;
        let remote_plain = cipher.incoming(&stored_remote)?;
        let remote_stored_hash = remote_file
            .hash
            .clone()
            .unwrap_or_else(|| md5_hex(&stored_remote));
        let entry = index.get(path).cloned();

        match self.strategy {
            ConflictStrategy::ForceLocal => {
                self.overwrite_remote(
                    path,
                    remote_file,
                    &local_bytes,
                    vfs,
                    remote,
                    index,
                    dirty,
                    cipher,
                )
                .await?;
                Ok(Resolution::ForcedLocal)
            }
            ConflictStrategy::ForceRemote => {
                self.adopt_remote(
                    path,
                    remote_file,
                    &remote_plain,
                    &remote_stored_hash,
                    vfs,
                    index,
                    dirty,
                )
                .await?;
                dirty.clear(path);
                Ok(Resolution::ForcedRemote)
            }
            ConflictStrategy::AlwaysFork => {
                self.fork(
                    path,
                    &local_bytes,
                    remote_file,
                    &remote_plain,
                    &remote_stored_hash,
                    vfs,
                    index,
                    dirty,
                    filters,
                )
                .await
            }
            ConflictStrategy::SmartMerge => {
                let base = self
                    .find_merge_base(path, entry.as_ref(), history, cipher)
                    .await;

                let Some((base_plain, base_stored_hash)) = base else {
                    return self
                        .fork(
                            path,
                            &local_bytes,
                            remote_file,
                            &remote_plain,
                            &remote_stored_hash,
                            vfs,
                            index,
                            dirty,
                            filters,
                        )
                        .await;
                };

                if local_bytes == base_plain {
                    // We never left the base: the divergence is one-sided.
                    self.adopt_remote(
                        path,
                        remote_file,
                        &remote_plain,
                        &remote_stored_hash,
                        vfs,
                        index,
                        dirty,
                    )
                    .await?;
                    return Ok(Resolution::Pulled);
                }
                if remote_plain == base_plain {
                    dirty.mark_dirty(path, filters);
                    return Ok(Resolution::LocalAhead);
                }

                match three_way_merge(&base_plain, &local_bytes, &remote_plain) {
                    Ok(MergeOutcome::Merged(merged)) if merged == remote_plain => {
                        // The remote already contains every local change;
                        // nothing to publish.
                        self.adopt_remote(
                            path,
                            remote_file,
                            &remote_plain,
                            &remote_stored_hash,
                            vfs,
                            index,
                            dirty,
                        )
                        .await?;
                        dirty.clear(path);
                        Ok(Resolution::Pulled)
                    }
                    Ok(MergeOutcome::Merged(merged)) => {
                        dirty.begin_syncing(path);
                        let write = vfs.write(path, &merged).await;
                        dirty.end_syncing(path);
                        write?;

                        let stat = vfs.stat(path).await?.with_context(|| {
                            format!("merged file vanished under us: {path}")
                        })?;
                        index.put(
                            path,
                            IndexEntry {
                                file_id: remote_file.id.clone(),
                                mtime: stat.mtime,
                                size: merged.len() as u64,
                                hash: md5_hex(&merged),
                                ancestor_hash: Some(base_stored_hash),
                                last_action: LastAction::Merge,
                            },
                        );
                        dirty.mark_dirty(path, filters);
                        Ok(Resolution::Merged)
                    }
                    Ok(MergeOutcome::Conflicted(_)) | Err(_) => {
                        self.fork(
                            path,
                            &local_bytes,
                            remote_file,
                            &remote_plain,
                            &remote_stored_hash,
                            vfs,
                            index,
                            dirty,
                            filters,
                        )
                        .await
                    }
                }
            }
        }
    }

    /// Locate the merge base through the remote revision history.
    ///
    /// Returns the plaintext base and the stored-bytes hash it was found
    /// under, or `None` when no shared revision can be identified.
    async fn find_merge_base(
        &self,
        path: &str,
        entry: Option<&IndexEntry>,
        history: &RevisionLog,
        cipher: &CipherBoundary,
    ) -> Option<(Vec<u8>, String)> {
        let entry = entry?;
        if !history.available() {
            return None;
        }
        let revisions = history.list(path).await.ok()?;

        let mut known: Vec<&str> = vec![entry.hash.as_str()];
        if let Some(ancestor) = entry.ancestor_hash.as_deref() {
            known.insert(0, ancestor);
        }

        // Prefer the recorded ancestor when a revision still carries it.
        if let Some(ancestor) = entry.ancestor_hash.as_deref() {
            if let Some(rev) = revisions
                .iter()
                .find(|r| r.hash.as_deref() == Some(ancestor))
            {
                let bytes = history.fetch(path, rev).await.ok()?;
                let plain = cipher.incoming(&bytes).ok()?;
                return Some((plain, ancestor.to_string()));
            }
        }

        // Otherwise walk newest-to-oldest for any hash we know was shared.
        for rev in revisions.iter().take(ANCESTOR_WALK_LIMIT) {
            let Some(hash) = rev.hash.as_deref() else {
                continue;
            };
            if known.contains(&hash) {
                let bytes = history.fetch(path, rev).await.ok()?;
                let plain = cipher.incoming(&bytes).ok()?;
                return Some((plain, hash.to_string()));
            }
        }
        None
    }

    /// Overwrite the remote with the local bytes, discarding the remote
    /// side entirely. The push is recorded like any other; the ancestor
    /// advances only at the next sync confirmation.
    #[allow(clippy::too_many_arguments)]
    async fn overwrite_remote(
        &self,
        path: &str,
        remote_file: &CloudFile,
        local_bytes: &[u8],
        vfs: &dyn Vfs,
        remote: &Remote,
        index: &mut SyncIndex,
        dirty: &mut DirtyTracker,
        cipher: &CipherBoundary,
    ) -> Result<()> {
        let stored = cipher.outgoing(local_bytes)?;
        let mtime = vfs
            .stat(path)
            .await?
            .map(|s| s.mtime)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let uploaded = remote
            .adapter
            .upload_file(path, &stored, mtime, Some(&remote_file.id))
            .await
            .with_context(|| format!("force-local upload of {path}"))?;

        let prior_ancestor = index.get(path).and_then(|e| e.ancestor_hash.clone());
        index.put(
            path,
            IndexEntry {
                file_id: uploaded.id,
                mtime,
                size: stored.len() as u64,
                hash: uploaded.hash.unwrap_or_else(|| md5_hex(&stored)),
                ancestor_hash: prior_ancestor,
                last_action: LastAction::Push,
            },
        );
        dirty.clear(path);
        Ok(())
    }

    /// Write the remote side to the canonical path and record it as pulled.
    #[allow(clippy::too_many_arguments)]
    async fn adopt_remote(
        &self,
        path: &str,
        remote_file: &CloudFile,
        remote_plain: &[u8],
        remote_stored_hash: &str,
        vfs: &dyn Vfs,
        index: &mut SyncIndex,
        dirty: &mut DirtyTracker,
    ) -> Result<()> {
        dirty.begin_syncing(path);
        let write = vfs.write(path, remote_plain).await;
        dirty.end_syncing(path);
        write?;

        index.put(
            path,
            IndexEntry {
                file_id: remote_file.id.clone(),
                mtime: remote_file.mtime,
                size: remote_file.size,
                hash: remote_stored_hash.to_string(),
                ancestor_hash: Some(remote_stored_hash.to_string()),
                last_action: LastAction::Pull,
            },
        );
        Ok(())
    }

    /// Remote wins the canonical path; the local side is preserved as a
    /// conflict-named sibling. Both end up dirty so the next push
    /// propagates them.
    #[allow(clippy::too_many_arguments)]
    async fn fork(
        &self,
        path: &str,
        local_bytes: &[u8],
        remote_file: &CloudFile,
        remote_plain: &[u8],
        remote_stored_hash: &str,
        vfs: &dyn Vfs,
        index: &mut SyncIndex,
        dirty: &mut DirtyTracker,
        filters: &SyncFilters,
    ) -> Result<Resolution> {
        let sibling = conflict_sibling_name(path, chrono::Utc::now());

        dirty.begin_syncing(&sibling);
        let write = vfs.write(&sibling, local_bytes).await;
        dirty.end_syncing(&sibling);
        write?;

        self.adopt_remote(
            path,
            remote_file,
            remote_plain,
            remote_stored_hash,
            vfs,
            index,
            dirty,
        )
        .await?;

        dirty.mark_dirty(&sibling, filters);
        dirty.mark_dirty(path, filters);
        Ok(Resolution::Forked { sibling })
    }

    async fn lease_held_elsewhere(&self, path: &str, remote: &Remote) -> Result<bool> {
        let doc = read_communication(remote).await;
        let now = chrono::Utc::now().timestamp_millis();
        Ok(doc.merges.iter().any(|m| {
            m.path == path && m.device != self.device_id && now - m.started_at < MERGE_LEASE_MS
        }))
    }

    /// Best effort: losing the announcement only costs a duplicate merge.
    async fn announce_merge(&self, path: &str, remote: &Remote) {
        let mut doc = read_communication(remote).await;
        let now = chrono::Utc::now().timestamp_millis();
        doc.merges
            .retain(|m| now - m.started_at < MERGE_LEASE_MS && m.path != path);
        doc.merges.push(MergeAnnouncement {
            device: self.device_id.clone(),
            path: path.to_string(),
            started_at: now,
        });
        let _ = write_communication(remote, &doc).await;
    }

    async fn withdraw_merge(&self, path: &str, remote: &Remote) {
        let mut doc = read_communication(remote).await;
        let before = doc.merges.len();
        doc.merges
            .retain(|m| !(m.path == path && m.device == self.device_id));
        if doc.merges.len() != before {
            let _ = write_communication(remote, &doc).await;
        }
    }
}

async fn read_communication(remote: &Remote) -> CommunicationDoc {
    let Ok(Some(meta)) = remote.adapter.get_file_metadata(COMMUNICATION_PATH).await else {
        return CommunicationDoc::default();
    };
    let Ok(bytes) = remote.adapter.download_file(&meta.id).await else {
        return CommunicationDoc::default();
    };
    serde_json::from_slice(&bytes).unwrap_or_default()
}

async fn write_communication(remote: &Remote, doc: &CommunicationDoc) -> Result<()> {
    let bytes = serde_json::to_vec(doc).context("encode communication file")?;
    let existing = remote
        .adapter
        .get_file_metadata(COMMUNICATION_PATH)
        .await?
        .map(|f| f.id);
    remote
        .adapter
        .upload_file(
            COMMUNICATION_PATH,
            &bytes,
            chrono::Utc::now().timestamp_millis(),
            existing.as_deref(),
        )
        .await?;
    Ok(())
}

/// `notes/a.md` -> `notes/a (Conflict 2026-08-01T12-00-00).md`
pub fn conflict_sibling_name(path: &str, at: chrono::DateTime<chrono::Utc>) -> String {
    let stamp = at.format("%Y-%m-%dT%H-%M-%S");
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let forked = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{stem} (Conflict {stamp}).{ext}")
        }
        _ => format!("{name} (Conflict {stamp})"),
    };
    match dir {
        Some(dir) => format!("{dir}/{forked}"),
        None => forked,
    }
}
