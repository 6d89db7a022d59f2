use std::collections::BTreeSet;

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};

use crate::codec::md5_hex;
use crate::conflict::{Resolution, Resolver};
use crate::dirty::DirtyTracker;
use crate::errors::{sync_error_kind, SyncError};
use crate::filters::SyncFilters;
use crate::history::RevisionLog;
use crate::index::{IndexDoc, IndexEntry, LastAction, SyncIndex};
use crate::reconcile::{decide, RemoteState, SyncDecision};
use crate::remote::{CloudFile, FileKind, Remote, RemoteChange};
use crate::vault_lock::CipherBoundary;
use crate::vfs::Vfs;

/// Stands in for a content hash when E2EE hides the plaintext identity;
/// never collides with an MD5 hex digest.
const LOCAL_MODIFIED_SENTINEL: &str = "#local-modified";

/// Transfer counters for one engine lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    pub files_pushed: u64,
    pub files_pulled: u64,
    pub local_deletes: u64,
    pub remote_deletes: u64,
    pub merges: u64,
    pub forks: u64,
    pub deferrals: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Everything one sync run needs. The exclusive borrows uphold the
/// single-writer invariant over the index and the dirty set.
pub struct SyncContext<'a> {
    pub vfs: &'a dyn Vfs,
    pub remote: &'a Remote,
    pub history: &'a RevisionLog,
    pub index: &'a mut SyncIndex,
    pub dirty: &'a mut DirtyTracker,
    pub filters: &'a SyncFilters,
    pub cipher: &'a CipherBoundary,
    pub resolver: &'a Resolver,
    pub concurrency: usize,
    /// Vault-relative path of the index document itself.
    pub index_path: &'a str,
    pub stats: &'a mut TransferStats,
}

/// Fast remote-to-local reconciliation: incremental deltas when a change
/// cursor is stored, otherwise an index-hash comparison that is O(1) when
/// the remote is unchanged.
pub async fn smart_pull(ctx: &mut SyncContext<'_>) -> Result<()> {
    let token = ctx.index.start_page_token().map(str::to_string);
    match (ctx.remote.changes.clone(), token) {
        (Some(cursor), Some(token)) => {
            let mut token = token;
            let mut new_start = None;
            let mut batch: Vec<RemoteChange> = Vec::new();
            loop {
                let page = cursor.get_changes(&token).await?;
                batch.extend(page.changes);
                if let Some(next) = page.next_page_token {
                    token = next;
                    continue;
                }
                new_start = page.new_start_page_token.or(new_start);
                break;
            }

            // Only the newest delta per path reflects the remote's current
            // state; earlier ones are history and must not be replayed.
            let mut latest: std::collections::BTreeMap<String, RemoteChange> =
                std::collections::BTreeMap::new();
            for change in batch {
                if let Some(path) = change.path.clone() {
                    latest.insert(path, change);
                }
            }

            for change in latest.into_values() {
                if let Err(err) = apply_remote_change(ctx, &change).await {
                    if sync_error_kind(&err).is_some_and(SyncError::is_fatal) {
                        return Err(err);
                    }
                    crate::logging::error(format!(
                        "pull delta failed for {:?}: {err:#}",
                        change.path
                    ));
                }
            }

            if let Some(new_start) = new_start {
                ctx.index.set_start_page_token(Some(new_start));
            }
            Ok(())
        }
        (cursor, _) => {
            pull_via_index_compare(ctx).await?;
            // Reconciliation just established a horizon; start cursoring
            // from here next time.
            if let Some(cursor) = cursor {
                if ctx.index.start_page_token().is_none() {
                    let token = cursor.get_start_page_token().await?;
                    ctx.index.set_start_page_token(Some(token));
                }
            }
            Ok(())
        }
    }
}

async fn apply_remote_change(ctx: &mut SyncContext<'_>, change: &RemoteChange) -> Result<()> {
    let Some(path) = change.path.as_deref() else {
        return Ok(());
    };
    // The index document and coordination noise never flow through deltas.
    if path == ctx.index_path || ctx.filters.should_ignore(path, false) {
        return Ok(());
    }

    if change.removed {
        if ctx.index.contains(path) {
            ctx.dirty.begin_syncing(path);
            let trashed = ctx.vfs.trash(path).await;
            ctx.dirty.end_syncing(path);
            trashed?;
            ctx.index.delete(path);
            ctx.dirty.clear(path);
            ctx.stats.local_deletes += 1;
        }
        return Ok(());
    }

    let remote_state = RemoteState {
        file_id: change.file_id.clone(),
        hash: change.hash.clone(),
        mtime: change.mtime,
        size: change.size,
    };
    reconcile_one(ctx, path, Some(&remote_state)).await
}

/// Compare the remote index document against ours and settle every
/// difference. Returns without further I/O when the remote index hash
/// matches our recorded upload.
async fn pull_via_index_compare(ctx: &mut SyncContext<'_>) -> Result<()> {
    let Some(meta) = ctx.remote.adapter.get_file_metadata(ctx.index_path).await? else {
        return Ok(()); // first sync against an empty remote
    };
    if let (Some(own), Some(remote_hash)) = (ctx.index.get(ctx.index_path), meta.hash.as_deref()) {
        if own.hash == remote_hash {
            return Ok(());
        }
    }

    let stored = ctx.remote.adapter.download_file(&meta.id).await?;
    let plain = ctx.cipher.incoming(&stored)?;
    let remote_doc = IndexDoc::parse(&plain).context("parse remote index")?;

    // Safety halts happen before any deletion is even considered.
    ctx.index
        .check_remote_replace(&remote_doc.index, stored.len(), ctx.index_path)?;

    let mut paths: BTreeSet<String> = ctx.index.paths().into_iter().collect();
    paths.extend(remote_doc.index.keys().cloned());
    paths.remove(ctx.index_path);

    let mut pulls: Vec<(String, RemoteState)> = Vec::new();
    for path in paths {
        if ctx.filters.should_ignore(&path, false) {
            continue;
        }
        let remote_state = remote_doc.index.get(&path).map(RemoteState::from_remote_entry);
        let stat = ctx.vfs.stat(&path).await?.filter(|s| !s.is_dir);
        let entry = ctx.index.get(&path).cloned();
        let probe = local_probe_hash(ctx, &path, stat.as_ref(), entry.as_ref()).await?;
        let decision = decide(
            stat.as_ref(),
            entry.as_ref(),
            remote_state.as_ref(),
            probe.as_deref(),
        );
        if deletion_pending(ctx, &path, decision, stat.is_none(), entry.is_some()) {
            continue;
        }
        if decision == SyncDecision::Pull {
            // Downloads batch up and fan out below.
            pulls.push((path, remote_state.expect("pull requires remote metadata")));
            continue;
        }
        if let Err(err) = apply_decision(ctx, &path, decision, remote_state.as_ref()).await {
            if sync_error_kind(&err).is_some_and(SyncError::is_fatal) {
                return Err(err);
            }
            crate::logging::error(format!("pull reconcile failed for {path}: {err:#}"));
        }
    }
    pull_many(ctx, pulls).await?;

    // Record the hash of the remote's uploaded bytes, never a disk
    // recomputation: the on-disk rendition contains this very entry.
    ctx.index.put(
        ctx.index_path,
        IndexEntry {
            file_id: meta.id.clone(),
            mtime: meta.mtime,
            size: stored.len() as u64,
            hash: meta.hash.unwrap_or_else(|| md5_hex(&stored)),
            ancestor_hash: None,
            last_action: LastAction::Pull,
        },
    );
    ctx.index.save()?;
    Ok(())
}

/// Decide and act for a single path.
pub(crate) async fn reconcile_one(
    ctx: &mut SyncContext<'_>,
    path: &str,
    remote_state: Option<&RemoteState>,
) -> Result<()> {
    let stat = ctx.vfs.stat(path).await?;
    let stat = stat.filter(|s| !s.is_dir);
    let entry = ctx.index.get(path).cloned();
    let probe = local_probe_hash(ctx, path, stat.as_ref(), entry.as_ref()).await?;

    let decision = decide(
        stat.as_ref(),
        entry.as_ref(),
        remote_state,
        probe.as_deref(),
    );
    if deletion_pending(ctx, path, decision, stat.is_none(), entry.is_some()) {
        return Ok(());
    }
    apply_decision(ctx, path, decision, remote_state).await
}

/// A locally deleted, still-indexed, dirty path is a deletion awaiting
/// push; pulling it back would resurrect the file.
fn deletion_pending(
    ctx: &SyncContext<'_>,
    path: &str,
    decision: SyncDecision,
    local_absent: bool,
    indexed: bool,
) -> bool {
    decision == SyncDecision::Pull && local_absent && indexed && ctx.dirty.is_dirty(path)
}

async fn apply_decision(
    ctx: &mut SyncContext<'_>,
    path: &str,
    decision: SyncDecision,
    remote_state: Option<&RemoteState>,
) -> Result<()> {
    match decision {
        SyncDecision::Skip => Ok(()),
        SyncDecision::PruneEntry => {
            ctx.index.delete(path);
            Ok(())
        }
        SyncDecision::AdoptEntry => {
            let remote = remote_state.expect("adopt requires remote metadata");
            let hash = remote.hash.clone().unwrap_or_default();
            ctx.index.put(
                path,
                IndexEntry {
                    file_id: remote.file_id.clone(),
                    mtime: remote.mtime,
                    size: remote.size,
                    hash: hash.clone(),
                    ancestor_hash: Some(hash),
                    last_action: LastAction::Pull,
                },
            );
            Ok(())
        }
        SyncDecision::RefreshEntry => {
            let remote = remote_state.expect("refresh requires remote metadata");
            if let Some(mut entry) = ctx.index.get(path).cloned() {
                entry.mtime = remote.mtime;
                if remote.size > 0 {
                    entry.size = remote.size;
                }
                // Sync confirmation: the hash is now known shared, which
                // licenses the ancestor advance.
                entry.ancestor_hash = Some(entry.hash.clone());
                entry.last_action = LastAction::Pull;
                ctx.index.put(path, entry);
            }
            Ok(())
        }
        SyncDecision::Pull => {
            let remote = remote_state.expect("pull requires remote metadata");
            pull_one(ctx, path, remote).await
        }
        SyncDecision::DeleteLocal => {
            ctx.dirty.begin_syncing(path);
            let trashed = ctx.vfs.trash(path).await;
            ctx.dirty.end_syncing(path);
            trashed?;
            ctx.index.delete(path);
            ctx.dirty.clear(path);
            ctx.stats.local_deletes += 1;
            Ok(())
        }
        SyncDecision::Push => {
            ctx.dirty.mark_dirty(path, ctx.filters);
            Ok(())
        }
        SyncDecision::Resolve => {
            let remote = remote_state.expect("resolve requires remote metadata");
            resolve_one(ctx, path, remote).await
        }
    }
}

async fn pull_one(ctx: &mut SyncContext<'_>, path: &str, remote: &RemoteState) -> Result<()> {
    let stored = ctx.remote.adapter.download_file(&remote.file_id).await?;
    finish_pull(ctx, path, remote, stored).await
}

/// Bounded-parallel downloads; writes and index updates stay serial with
/// the rest of the engine.
async fn pull_many(ctx: &mut SyncContext<'_>, pulls: Vec<(String, RemoteState)>) -> Result<()> {
    if pulls.is_empty() {
        return Ok(());
    }
    let adapter = ctx.remote.adapter.clone();
    let concurrency = ctx.concurrency.max(1);

    let downloads: Vec<(String, RemoteState, Result<Vec<u8>>)> =
        stream::iter(pulls.into_iter().map(|(path, remote)| {
            let adapter = adapter.clone();
            async move {
                let result = adapter.download_file(&remote.file_id).await;
                (path, remote, result)
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (path, remote, result) in downloads {
        let outcome = match result {
            Ok(stored) => finish_pull(ctx, &path, &remote, stored).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            if sync_error_kind(&err).is_some_and(SyncError::is_fatal) {
                return Err(err);
            }
            crate::logging::error(format!("pull failed for {path}: {err:#}"));
        }
    }
    Ok(())
}

async fn finish_pull(
    ctx: &mut SyncContext<'_>,
    path: &str,
    remote: &RemoteState,
    stored: Vec<u8>,
) -> Result<()> {
    let plain = ctx.cipher.incoming(&stored)?;

    ctx.dirty.begin_syncing(path);
    let write = ctx.vfs.write(path, &plain).await;
    ctx.dirty.end_syncing(path);
    write?;

    let hash = remote
        .hash
        .clone()
        .unwrap_or_else(|| md5_hex(&stored));
    ctx.index.put(
        path,
        IndexEntry {
            file_id: remote.file_id.clone(),
            mtime: remote.mtime,
            size: stored.len() as u64,
            hash: hash.clone(),
            // A pull that lands on disk is by definition shared content.
            ancestor_hash: Some(hash),
            last_action: LastAction::Pull,
        },
    );
    ctx.dirty.clear(path);
    ctx.stats.files_pulled += 1;
    ctx.stats.bytes_down += stored.len() as u64;
    Ok(())
}

async fn resolve_one(ctx: &mut SyncContext<'_>, path: &str, remote: &RemoteState) -> Result<()> {
    let file = match ctx
        .remote
        .adapter
        .get_file_metadata_by_id(&remote.file_id, Some(path))
        .await?
    {
        Some(file) => file,
        None => CloudFile {
            id: remote.file_id.clone(),
            path: path.to_string(),
            mtime: remote.mtime,
            size: remote.size,
            kind: FileKind::File,
            hash: remote.hash.clone(),
        },
    };
    let resolution = ctx
        .resolver
        .resolve(
            path,
            &file,
            ctx.vfs,
            ctx.remote,
            ctx.history,
            ctx.index,
            ctx.dirty,
            ctx.filters,
            ctx.cipher,
        )
        .await?;
    match resolution {
        Resolution::Merged => ctx.stats.merges += 1,
        Resolution::Forked { .. } => ctx.stats.forks += 1,
        Resolution::Pulled | Resolution::ForcedRemote => ctx.stats.files_pulled += 1,
        Resolution::ForcedLocal => ctx.stats.files_pushed += 1,
        Resolution::Deferred => ctx.stats.deferrals += 1,
        Resolution::LocalAhead => {}
    }
    Ok(())
}

/// Hash-like identity of the local bytes used by the decision table.
///
/// With E2EE enabled the index tracks ciphertext hashes, so plaintext
/// hashing cannot witness cleanliness; mtime equality with the entry
/// stands in instead.
async fn local_probe_hash(
    ctx: &SyncContext<'_>,
    path: &str,
    stat: Option<&crate::vfs::FileStat>,
    entry: Option<&IndexEntry>,
) -> Result<Option<String>> {
    let Some(stat) = stat else {
        return Ok(None);
    };
    if ctx.cipher.is_enabled() {
        return Ok(Some(match entry {
            Some(entry) if stat.mtime == entry.mtime => entry.hash.clone(),
            Some(_) => LOCAL_MODIFIED_SENTINEL.to_string(),
            None => md5_hex(&ctx.vfs.read(path).await?),
        }));
    }
    Ok(Some(md5_hex(&ctx.vfs.read(path).await?)))
}

/// One item the push phase will upload.
struct UploadItem {
    path: String,
    plain: Vec<u8>,
    mtime: i64,
    existing_id: Option<String>,
    prior: Option<IndexEntry>,
}

/// Push local changes: optionally re-scan the vault for events missed
/// while the process was down, verify queued content is not mid-write,
/// create remote folders, upload with bounded parallelism, apply queued
/// deletions, and finally publish the updated index.
pub async fn smart_push(ctx: &mut SyncContext<'_>, scan_vault: bool) -> Result<()> {
    if scan_vault {
        scan_for_missed_changes(ctx, None).await?;
    }
    // Events never fire for the hidden configuration directory.
    scan_for_missed_changes(ctx, Some(".vaultsync/")).await?;

    // Resolutions may re-dirty paths (merged output); give those one
    // follow-up pass so a merge propagates within the same run.
    for _round in 0..2 {
        let progressed = push_round(ctx).await?;
        if !progressed {
            break;
        }
    }

    publish_index(ctx).await
}

/// Returns true when any resolution left fresh dirty work behind.
async fn push_round(ctx: &mut SyncContext<'_>) -> Result<bool> {
    let mut uploads: Vec<UploadItem> = Vec::new();
    let mut deletions: Vec<(String, IndexEntry)> = Vec::new();
    let mut resolutions: Vec<(String, RemoteState)> = Vec::new();

    for path in ctx.dirty.paths() {
        if path == ctx.index_path {
            ctx.dirty.clear(&path);
            continue;
        }
        let Some(stat) = ctx.vfs.stat(&path).await?.filter(|s| !s.is_dir) else {
            match ctx.index.get(&path).cloned() {
                Some(entry) => deletions.push((path, entry)),
                None => ctx.dirty.clear(&path),
            }
            continue;
        };

        // Torn-write guard: content is only trusted when the mtime seen
        // before the read still holds afterwards.
        let plain = ctx.vfs.read(&path).await?;
        let after = ctx.vfs.stat(&path).await?.filter(|s| !s.is_dir);
        let torn = match after {
            Some(after) => after.mtime != stat.mtime || after.size != plain.len() as u64,
            None => true,
        };
        if torn {
            crate::logging::info(format!("skipping mid-write file this round: {path}"));
            continue;
        }

        let prior = ctx.index.get(&path).cloned();

        // Push-time conflict check against live remote metadata.
        let live = match prior.as_ref() {
            Some(entry) => {
                ctx.remote
                    .adapter
                    .get_file_metadata_by_id(&entry.file_id, Some(&path))
                    .await?
            }
            None => ctx.remote.adapter.get_file_metadata(&path).await?,
        };

        match (prior.as_ref(), live) {
            (Some(entry), Some(live)) => {
                let live_hash = live.hash.clone();
                if entry.last_action == LastAction::Merge {
                    // The merge already incorporated the remote side; the
                    // push that publishes it wins the canonical slot.
                    uploads.push(UploadItem {
                        path,
                        plain,
                        mtime: stat.mtime,
                        existing_id: Some(entry.file_id.clone()),
                        prior: Some(entry.clone()),
                    });
                } else if live_hash.as_deref() == Some(entry.hash.as_str()) {
                    // Remote still holds what we last synced; the hash is
                    // confirmed shared, so the ancestor may advance.
                    let mut entry = entry.clone();
                    entry.ancestor_hash = Some(entry.hash.clone());
                    ctx.index.put(&path, entry.clone());
                    uploads.push(UploadItem {
                        path,
                        plain,
                        mtime: stat.mtime,
                        existing_id: Some(entry.file_id.clone()),
                        prior: Some(entry),
                    });
                } else {
                    resolutions.push((path, RemoteState::from_cloud(&live)));
                }
            }
            (Some(entry), None) => {
                // Remote vanished under us: push as a fresh object.
                uploads.push(UploadItem {
                    path,
                    plain,
                    mtime: stat.mtime,
                    existing_id: None,
                    prior: Some(entry.clone()),
                });
            }
            (None, Some(live)) => {
                // Created on both sides independently.
                if live.hash.as_deref() == Some(md5_if_plain(ctx, &plain).as_str()) {
                    apply_decision(
                        ctx,
                        &path,
                        SyncDecision::AdoptEntry,
                        Some(&RemoteState::from_cloud(&live)),
                    )
                    .await?;
                    ctx.dirty.clear(&path);
                } else {
                    resolutions.push((path, RemoteState::from_cloud(&live)));
                }
            }
            (None, None) => uploads.push(UploadItem {
                path,
                plain,
                mtime: stat.mtime,
                existing_id: None,
                prior: None,
            }),
        }
    }

    ensure_remote_folders(ctx, &uploads).await?;
    upload_parallel(ctx, uploads).await?;

    for (path, entry) in deletions {
        match ctx.remote.adapter.delete_file(&entry.file_id).await {
            Ok(()) => {
                ctx.index.delete(&path);
                ctx.dirty.clear(&path);
                ctx.stats.remote_deletes += 1;
            }
            Err(err) => {
                crate::logging::error(format!("remote delete failed for {path}: {err:#}"));
            }
        }
    }

    let had_resolutions = !resolutions.is_empty();
    for (path, remote_state) in resolutions {
        if let Err(err) = resolve_one(ctx, &path, &remote_state).await {
            if sync_error_kind(&err).is_some_and(SyncError::is_fatal) {
                return Err(err);
            }
            crate::logging::error(format!("conflict resolution failed for {path}: {err:#}"));
        }
    }

    Ok(had_resolutions && !ctx.dirty.is_empty())
}

fn md5_if_plain(ctx: &SyncContext<'_>, plain: &[u8]) -> String {
    if ctx.cipher.is_enabled() {
        // Ciphertext identities are unique per encryption; adoption by
        // hash equality is impossible under E2EE.
        LOCAL_MODIFIED_SENTINEL.to_string()
    } else {
        md5_hex(plain)
    }
}

/// Walk the vault (or one folder of it) and dirty anything whose disk
/// state no longer matches its entry, plus tombstones for indexed paths
/// that vanished while events were not flowing.
async fn scan_for_missed_changes(ctx: &mut SyncContext<'_>, prefix: Option<&str>) -> Result<()> {
    let listing = ctx.vfs.list().await?;
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for (path, stat) in listing {
        if let Some(prefix) = prefix {
            if !path.starts_with(prefix) {
                continue;
            }
        }
        if ctx.filters.should_ignore(&path, false) || path == ctx.index_path {
            continue;
        }
        seen.insert(path.clone());

        match ctx.index.get(&path) {
            None => ctx.dirty.mark_dirty(&path, ctx.filters),
            Some(entry) => {
                if stat.mtime > entry.mtime {
                    // Suspected modification; hash-verify before dirtying.
                    let entry = entry.clone();
                    let probe = local_probe_hash(ctx, &path, Some(&stat), Some(&entry)).await?;
                    if probe.as_deref() != Some(entry.hash.as_str()) {
                        ctx.dirty.mark_dirty(&path, ctx.filters);
                    }
                }
            }
        }
    }

    // Deletions that happened while the watcher was down.
    for path in ctx.index.paths() {
        if path == ctx.index_path || seen.contains(&path) {
            continue;
        }
        if let Some(prefix) = prefix {
            if !path.starts_with(prefix) {
                continue;
            }
        }
        if ctx.filters.should_ignore(&path, false) {
            continue;
        }
        if !ctx.vfs.exists(&path).await {
            ctx.dirty.mark_deleted(&path, ctx.index);
        }
    }
    Ok(())
}

/// Create every folder the upload set needs, shallowest first.
async fn ensure_remote_folders(ctx: &SyncContext<'_>, uploads: &[UploadItem]) -> Result<()> {
    let mut folders: BTreeSet<String> = BTreeSet::new();
    for item in uploads {
        let mut current = String::new();
        let Some((dir, _)) = item.path.rsplit_once('/') else {
            continue;
        };
        for seg in dir.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(seg);
            folders.insert(current.clone());
        }
    }
    if folders.is_empty() {
        return Ok(());
    }
    let mut ordered: Vec<String> = folders.into_iter().collect();
    ordered.sort_by_key(|f| f.matches('/').count());
    ctx.remote.adapter.ensure_folders_exist(&ordered).await
}

async fn upload_parallel(ctx: &mut SyncContext<'_>, uploads: Vec<UploadItem>) -> Result<()> {
    if uploads.is_empty() {
        return Ok(());
    }

    struct Uploaded {
        path: String,
        mtime: i64,
        stored_len: u64,
        prior: Option<IndexEntry>,
        result: Result<CloudFile>,
    }

    let adapter = ctx.remote.adapter.clone();
    let concurrency = ctx.concurrency.max(1);

    // Encrypt serially (the keychain is not sharable across tasks), then
    // fan the network transfers out.
    let mut prepared = Vec::with_capacity(uploads.len());
    for item in uploads {
        let stored = ctx.cipher.outgoing(&item.plain)?;
        prepared.push((item, stored));
    }

    let results: Vec<Uploaded> = stream::iter(prepared.into_iter().map(|(item, stored)| {
        let adapter = adapter.clone();
        async move {
            let result = adapter
                .upload_file(&item.path, &stored, item.mtime, item.existing_id.as_deref())
                .await;
            Uploaded {
                path: item.path,
                mtime: item.mtime,
                stored_len: stored.len() as u64,
                prior: item.prior,
                result,
            }
        }
    }))
    .buffer_unordered(concurrency)
    .collect()
    .await;

    for up in results {
        match up.result {
            Ok(file) => {
                let hash = file.hash.clone().unwrap_or_default();
                let ancestor = up.prior.as_ref().and_then(|e| e.ancestor_hash.clone());
                ctx.index.put(
                    &up.path,
                    IndexEntry {
                        file_id: file.id,
                        mtime: up.mtime,
                        size: up.stored_len,
                        hash,
                        // A push alone never advances the ancestor.
                        ancestor_hash: ancestor,
                        last_action: LastAction::Push,
                    },
                );
                ctx.dirty.clear(&up.path);
                ctx.stats.files_pushed += 1;
                ctx.stats.bytes_up += up.stored_len;
            }
            Err(err) => {
                // Leave it dirty; the next run retries.
                crate::logging::error(format!("upload failed for {}: {err:#}", up.path));
            }
        }
    }
    Ok(())
}

/// Persist the index locally, then publish the gzipped document plus an
/// uncompressed recovery copy, and finally record the uploaded hash in the
/// index's own entry.
async fn publish_index(ctx: &mut SyncContext<'_>) -> Result<()> {
    ctx.index.save()?;

    let wire = ctx.index.to_wire_bytes()?;
    let stored = ctx.cipher.outgoing(&wire)?;
    let existing = ctx.index.get(ctx.index_path).map(|e| e.file_id.clone());
    let now = chrono::Utc::now().timestamp_millis();

    let uploaded = ctx
        .remote
        .adapter
        .upload_file(ctx.index_path, &stored, now, existing.as_deref())
        .await
        .context("upload index")?;

    let raw = ctx.index.to_raw_bytes()?;
    let raw_stored = ctx.cipher.outgoing(&raw)?;
    let raw_path = format!("{}_raw", ctx.index_path);
    let raw_existing = ctx
        .remote
        .adapter
        .get_file_metadata(&raw_path)
        .await?
        .map(|f| f.id);
    if let Err(err) = ctx
        .remote
        .adapter
        .upload_file(&raw_path, &raw_stored, now, raw_existing.as_deref())
        .await
    {
        crate::logging::error(format!("raw index upload failed: {err:#}"));
    }

    ctx.index.put(
        ctx.index_path,
        IndexEntry {
            file_id: uploaded.id,
            mtime: now,
            size: stored.len() as u64,
            hash: uploaded.hash.unwrap_or_else(|| md5_hex(&stored)),
            ancestor_hash: None,
            last_action: LastAction::Push,
        },
    );
    ctx.index.save()?;
    Ok(())
}
