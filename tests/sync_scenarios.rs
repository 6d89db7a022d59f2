use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use vaultsync::codec::md5_hex;
use vaultsync::config::Config;
use vaultsync::conflict::{ConflictStrategy, Resolution, Resolver};
use vaultsync::dirty::DirtyTracker;
use vaultsync::engine::Engine;
use vaultsync::errors::{sync_error_kind, SyncError};
use vaultsync::events::VaultEvent;
use vaultsync::filters::SyncFilters;
use vaultsync::history::RevisionLog;
use vaultsync::index::{IndexEntry, LastAction, SyncIndex};
use vaultsync::remote::{MemoryCloud, Remote};
use vaultsync::vault_lock::CipherBoundary;
use vaultsync::vfs::{DiskVfs, Vfs};

fn temp_dir(tag: &str) -> PathBuf {
    let mut root = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    root.push(format!("vaultsync-scenario-{tag}-{nanos}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn device(tag: &str, remote: Remote, strategy: ConflictStrategy) -> Engine {
    let dir = temp_dir(tag);
    let cfg = Config {
        vault_dir: dir,
        device_id: format!("device-{tag}"),
        concurrency: 4,
        strategy,
        e2ee: false,
        sync_interval_secs: 60,
        config_path: None,
    };
    let vfs: Arc<dyn Vfs> = Arc::new(DiskVfs::new(&cfg.vault_dir));
    Engine::new(cfg, vfs, remote, CipherBoundary::disabled()).unwrap()
}

fn write_note(engine: &Engine, path: &str, content: &str) {
    let abs = engine.cfg().vault_dir.join(path);
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(abs, content).unwrap();
}

fn read_note(engine: &Engine, path: &str) -> String {
    String::from_utf8(std::fs::read(engine.cfg().vault_dir.join(path)).unwrap()).unwrap()
}

/// Scenario 1: non-overlapping edits on two devices converge through a
/// push-time conflict and a line merge, and both entries settle to `pull`
/// with identical hashes.
#[tokio::test]
async fn non_overlapping_edits_merge_across_devices() {
    let (remote, cloud) = Remote::memory();
    let mut a = device("s1a", remote.clone(), ConflictStrategy::SmartMerge);
    let mut b = device("s1b", remote.clone(), ConflictStrategy::SmartMerge);

    write_note(&a, "note.md", "Line 1\nLine 2\n");
    a.apply_event(&VaultEvent::Created("note.md".into()));
    a.smart_sync(false).await.unwrap();

    b.smart_sync(false).await.unwrap();
    assert_eq!(read_note(&b, "note.md"), "Line 1\nLine 2\n");

    write_note(&a, "note.md", "Line 1 edited by A\nLine 2\n");
    a.apply_event(&VaultEvent::Modified("note.md".into()));
    a.smart_sync(false).await.unwrap();

    write_note(&b, "note.md", "Line 1\nLine 2 edited by B\n");
    b.apply_event(&VaultEvent::Modified("note.md".into()));
    b.smart_sync(false).await.unwrap();

    let merged = "Line 1 edited by A\nLine 2 edited by B\n";
    assert_eq!(read_note(&b, "note.md"), merged);
    assert_eq!(cloud.bytes_at("note.md").unwrap(), merged.as_bytes());

    // A reconciles against the merged remote; B's next cycle is the sync
    // confirmation that settles its entry.
    a.smart_sync(false).await.unwrap();
    b.smart_sync(false).await.unwrap();
    assert_eq!(read_note(&a, "note.md"), merged);

    let ea = a.index().get("note.md").unwrap();
    let eb = b.index().get("note.md").unwrap();
    assert_eq!(ea.last_action, LastAction::Pull);
    assert_eq!(eb.last_action, LastAction::Pull);
    assert_eq!(ea.hash, eb.hash);
    assert_eq!(ea.hash, md5_hex(merged.as_bytes()));
}

/// Scenario 2: overlapping edits under `always-fork` keep the remote as
/// canonical and preserve the local side as a conflict sibling; both
/// propagate on the next push.
#[tokio::test]
async fn overlapping_edits_fork_under_always_fork() {
    let (remote, cloud) = Remote::memory();
    let mut a = device("s2a", remote.clone(), ConflictStrategy::SmartMerge);
    let mut b = device("s2b", remote.clone(), ConflictStrategy::AlwaysFork);

    write_note(&a, "note.md", "Line 1\nLine 2\n");
    a.apply_event(&VaultEvent::Created("note.md".into()));
    a.smart_sync(false).await.unwrap();
    b.smart_sync(false).await.unwrap();

    write_note(&a, "note.md", "Line 1\nLine 2\nLine 3 from DeviceA\n");
    a.apply_event(&VaultEvent::Modified("note.md".into()));
    a.smart_sync(false).await.unwrap();

    write_note(&b, "note.md", "Line 1\nLine 2\nLine 3 from DeviceB\n");
    b.apply_event(&VaultEvent::Modified("note.md".into()));
    b.smart_sync(false).await.unwrap();

    // Canonical path holds the remote (A's) version.
    assert_eq!(
        read_note(&b, "note.md"),
        "Line 1\nLine 2\nLine 3 from DeviceA\n"
    );

    // The loser survives as a conflict-named sibling carrying B's line.
    let sibling = std::fs::read_dir(b.cfg().vault_dir.clone())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .find(|name| name.contains("(Conflict "))
        .expect("conflict sibling exists");
    assert_eq!(
        read_note(&b, &sibling),
        "Line 1\nLine 2\nLine 3 from DeviceB\n"
    );

    // Both paths reached the remote.
    assert_eq!(
        cloud.bytes_at("note.md").unwrap(),
        b"Line 1\nLine 2\nLine 3 from DeviceA\n"
    );
    assert_eq!(
        cloud.bytes_at(&sibling).unwrap(),
        b"Line 1\nLine 2\nLine 3 from DeviceB\n"
    );
}

/// `force-local` on a divergence overwrites the remote with the local
/// bytes and settles the entry without leaving the path dirty.
#[tokio::test]
async fn force_local_overwrites_remote_side() {
    let (remote, cloud) = Remote::memory();
    let mut a = device("fla", remote.clone(), ConflictStrategy::SmartMerge);
    let mut b = device("flb", remote.clone(), ConflictStrategy::ForceLocal);

    write_note(&a, "note.md", "Line 1\nLine 2\n");
    a.apply_event(&VaultEvent::Created("note.md".into()));
    a.smart_sync(false).await.unwrap();
    b.smart_sync(false).await.unwrap();

    write_note(&a, "note.md", "Line 1 from A\nLine 2\n");
    a.apply_event(&VaultEvent::Modified("note.md".into()));
    a.smart_sync(false).await.unwrap();

    write_note(&b, "note.md", "Line 1\nLine 2 from B\n");
    b.apply_event(&VaultEvent::Modified("note.md".into()));
    b.smart_sync(false).await.unwrap();

    // B's copy won outright; A's divergent edit is gone from the head
    // (it survives only in the remote revision history).
    assert_eq!(
        cloud.bytes_at("note.md").unwrap(),
        b"Line 1\nLine 2 from B\n"
    );
    assert_eq!(read_note(&b, "note.md"), "Line 1\nLine 2 from B\n");
    assert!(!b.dirty().is_dirty("note.md"));

    let entry = b.index().get("note.md").unwrap();
    assert_eq!(entry.last_action, LastAction::Push);
    assert_eq!(entry.hash, md5_hex(b"Line 1\nLine 2 from B\n"));

    // No conflict sibling was produced.
    let siblings = std::fs::read_dir(b.cfg().vault_dir.clone())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains("(Conflict "))
        .count();
    assert_eq!(siblings, 0);
}

/// `force-remote` on a divergence discards the local edit in favor of the
/// remote bytes and leaves the remote untouched.
#[tokio::test]
async fn force_remote_overwrites_local_side() {
    let (remote, cloud) = Remote::memory();
    let mut a = device("fra", remote.clone(), ConflictStrategy::SmartMerge);
    let mut b = device("frb", remote.clone(), ConflictStrategy::ForceRemote);

    write_note(&a, "note.md", "Line 1\nLine 2\n");
    a.apply_event(&VaultEvent::Created("note.md".into()));
    a.smart_sync(false).await.unwrap();
    b.smart_sync(false).await.unwrap();

    write_note(&a, "note.md", "Line 1 from A\nLine 2\n");
    a.apply_event(&VaultEvent::Modified("note.md".into()));
    a.smart_sync(false).await.unwrap();

    write_note(&b, "note.md", "Line 1\nLine 2 from B\n");
    b.apply_event(&VaultEvent::Modified("note.md".into()));
    b.smart_sync(false).await.unwrap();

    assert_eq!(read_note(&b, "note.md"), "Line 1 from A\nLine 2\n");
    assert_eq!(
        cloud.bytes_at("note.md").unwrap(),
        b"Line 1 from A\nLine 2\n"
    );
    assert!(!b.dirty().is_dirty("note.md"));

    let entry = b.index().get("note.md").unwrap();
    assert_eq!(entry.last_action, LastAction::Pull);
    assert_eq!(entry.hash, md5_hex(b"Line 1 from A\nLine 2\n"));
}

/// Scenario 3: the stale-pull guard. A's last action was a push and its
/// disk agrees with its index, yet the remote hash is foreign; A must
/// merge rather than overwrite local work with the remote.
#[tokio::test]
async fn stale_pull_merges_instead_of_overwriting() {
    let (remote, cloud) = Remote::memory();
    let mut a = device("s3a", remote.clone(), ConflictStrategy::SmartMerge);

    write_note(&a, "note.md", "Line 1\nLine 2\n");
    a.apply_event(&VaultEvent::Created("note.md".into()));
    a.smart_sync(false).await.unwrap();
    // Settle the entry (sync confirmation).
    a.smart_sync(false).await.unwrap();

    write_note(&a, "note.md", "Line 1 edited by A\nLine 2\n");
    a.apply_event(&VaultEvent::Modified("note.md".into()));
    a.smart_sync(false).await.unwrap();

    // Another device, unaware of A's push, overwrites the remote with an
    // edit built on the original content.
    cloud.force_put("note.md", b"Line 1\nLine 2 edited by B\n", 9_000);

    a.smart_sync(false).await.unwrap();
    assert_eq!(
        read_note(&a, "note.md"),
        "Line 1 edited by A\nLine 2 edited by B\n"
    );
    assert_eq!(
        cloud.bytes_at("note.md").unwrap(),
        b"Line 1 edited by A\nLine 2 edited by B\n"
    );
}

/// The resolver itself records `merge` as the action and keeps the base
/// hash as the ancestor.
#[tokio::test]
async fn resolver_merge_sets_merge_action_and_ancestor() {
    let dir = temp_dir("resolver");
    let vfs = DiskVfs::new(&dir);
    let (remote, cloud) = Remote::memory();
    let history = RevisionLog::new(&remote);
    let filters = SyncFilters::load(&dir).unwrap();
    let cipher = CipherBoundary::disabled();
    let mut index = SyncIndex::load(&dir.join(".vaultsync").join("index.json"));
    let mut dirty = DirtyTracker::new();

    let v0 = b"Line 1\nLine 2\n";
    let v1 = b"Line 1 edited by A\nLine 2\n";

    // Remote history: v0, then our push v1, then a foreign overwrite.
    let f = remote
        .adapter
        .upload_file("note.md", v0, 1_000, None)
        .await
        .unwrap();
    remote
        .adapter
        .upload_file("note.md", v1, 2_000, Some(&f.id))
        .await
        .unwrap();
    cloud.force_put("note.md", b"Line 1\nLine 2 edited by B\n", 3_000);

    std::fs::write(dir.join("note.md"), v1).unwrap();
    index.put(
        "note.md",
        IndexEntry {
            file_id: f.id.clone(),
            mtime: 2_000,
            size: v1.len() as u64,
            hash: md5_hex(v1),
            ancestor_hash: Some(md5_hex(v0)),
            last_action: LastAction::Push,
        },
    );

    let remote_file = remote
        .adapter
        .get_file_metadata("note.md")
        .await
        .unwrap()
        .unwrap();
    let resolver = Resolver::new(ConflictStrategy::SmartMerge, "device-r");
    let resolution = resolver
        .resolve(
            "note.md",
            &remote_file,
            &vfs,
            &remote,
            &history,
            &mut index,
            &mut dirty,
            &filters,
            &cipher,
        )
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Merged);
    let entry = index.get("note.md").unwrap();
    assert_eq!(entry.last_action, LastAction::Merge);
    assert_eq!(entry.ancestor_hash.as_deref(), Some(md5_hex(v0).as_str()));
    assert!(dirty.is_dirty("note.md"));
    assert_eq!(
        std::fs::read(dir.join("note.md")).unwrap(),
        b"Line 1 edited by A\nLine 2 edited by B\n"
    );
}

/// A second device holding a fresh merge lease defers resolution here.
#[tokio::test]
async fn fresh_foreign_lease_defers_resolution() {
    let dir = temp_dir("lease");
    let vfs = DiskVfs::new(&dir);
    let (remote, _cloud) = Remote::memory();
    let history = RevisionLog::new(&remote);
    let filters = SyncFilters::load(&dir).unwrap();
    let cipher = CipherBoundary::disabled();
    let mut index = SyncIndex::load(&dir.join(".vaultsync").join("index.json"));
    let mut dirty = DirtyTracker::new();

    let f = remote
        .adapter
        .upload_file("note.md", b"remote\n", 1_000, None)
        .await
        .unwrap();
    std::fs::write(dir.join("note.md"), b"local\n").unwrap();

    // Another device announced a merge of this path moments ago.
    let lease = format!(
        r#"{{"merges":[{{"device":"device-other","path":"note.md","startedAt":{}}}]}}"#,
        chrono::Utc::now().timestamp_millis()
    );
    remote
        .adapter
        .upload_file(".vaultsync/communication.json", lease.as_bytes(), 1_000, None)
        .await
        .unwrap();

    let remote_file = remote
        .adapter
        .get_file_metadata_by_id(&f.id, None)
        .await
        .unwrap()
        .unwrap();
    let resolver = Resolver::new(ConflictStrategy::SmartMerge, "device-l");
    let resolution = resolver
        .resolve(
            "note.md",
            &remote_file,
            &vfs,
            &remote,
            &history,
            &mut index,
            &mut dirty,
            &filters,
            &cipher,
        )
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::Deferred);
    // Nothing was written or recorded.
    assert_eq!(std::fs::read(dir.join("note.md")).unwrap(), b"local\n");
    assert!(index.get("note.md").is_none());
}

/// Scenario 4: an implausibly empty remote index must never translate
/// into local deletions.
#[tokio::test]
async fn empty_remote_index_halts_before_deleting() {
    let cloud = Arc::new(MemoryCloud::default());
    // Cursorless remote: every pull goes through the index comparison.
    let remote = Remote::new(cloud.clone(), None, Some(cloud.clone()));
    let mut a = device("s4", remote.clone(), ConflictStrategy::SmartMerge);

    for i in 0..25 {
        let path = format!("notes/f{i:02}.md");
        write_note(&a, &path, "body\n");
        a.apply_event(&VaultEvent::Created(path));
    }
    a.smart_sync(false).await.unwrap();
    assert_eq!(cloud.file_count(), 25 + 2); // + index and raw copy

    // The remote index collapses to zero entries.
    let empty = vaultsync::codec::gzip(br#"{"index":{},"startPageToken":null}"#).unwrap();
    cloud.force_put(".vaultsync/index.json", &empty, 9_000);

    let err = a.smart_sync(false).await.unwrap_err();
    assert!(
        matches!(
            sync_error_kind(&err),
            Some(SyncError::SafetyHalt(_)) | Some(SyncError::RemoteCorruption(_))
        ),
        "expected a guard error, got: {err:#}"
    );

    // Every local file and entry survived.
    for i in 0..25 {
        assert!(a
            .cfg()
            .vault_dir
            .join(format!("notes/f{i:02}.md"))
            .exists());
    }
    assert!(a.index().len() >= 25);
}

/// A partially-emptied remote index (majority of paths gone, payload well
/// over the corruption floor) is treated as corruption.
#[tokio::test]
async fn majority_removal_in_remote_index_is_corruption() {
    let cloud = Arc::new(MemoryCloud::default());
    let remote = Remote::new(cloud.clone(), None, Some(cloud.clone()));
    let mut a = device("s4b", remote.clone(), ConflictStrategy::SmartMerge);

    for i in 0..10 {
        let path = format!("f{i}.md");
        write_note(&a, &path, "body\n");
        a.apply_event(&VaultEvent::Created(path));
    }
    a.smart_sync(false).await.unwrap();

    // Build a remote index that kept only two paths.
    let mut kept = String::from("{\"index\":{");
    for (n, i) in [0usize, 1].iter().enumerate() {
        if n > 0 {
            kept.push(',');
        }
        kept.push_str(&format!(
            r#""f{i}.md":{{"fileId":"mem-x{i}","mtime":1,"size":5,"hash":"{}","lastAction":"push"}}"#,
            md5_hex(b"body\n")
        ));
    }
    // Incompressible padding keeps the gzipped payload above the
    // corruption-guard floor.
    let pad: String = (0u8..40).map(|i| md5_hex(&[i])).collect();
    kept.push_str(&format!("}},\"startPageToken\":null,\"pad\":\"{pad}\"}}"));
    let wire = vaultsync::codec::gzip(kept.as_bytes()).unwrap();
    cloud.force_put(".vaultsync/index.json", &wire, 9_000);

    let err = a.smart_sync(false).await.unwrap_err();
    assert!(matches!(
        sync_error_kind(&err),
        Some(SyncError::RemoteCorruption(_))
    ));
    for i in 0..10 {
        assert!(a.cfg().vault_dir.join(format!("f{i}.md")).exists());
    }
}

/// Deletions propagate: removing a synced file on one device trashes it
/// on the other instead of unlinking.
#[tokio::test]
async fn delete_propagates_to_trash() {
    let (remote, _cloud) = Remote::memory();
    let mut a = device("s5a", remote.clone(), ConflictStrategy::SmartMerge);
    let mut b = device("s5b", remote.clone(), ConflictStrategy::SmartMerge);

    write_note(&a, "doomed.md", "bytes\n");
    a.apply_event(&VaultEvent::Created("doomed.md".into()));
    a.smart_sync(false).await.unwrap();
    b.smart_sync(false).await.unwrap();
    assert!(b.cfg().vault_dir.join("doomed.md").exists());

    std::fs::remove_file(a.cfg().vault_dir.join("doomed.md")).unwrap();
    a.apply_event(&VaultEvent::Deleted("doomed.md".into()));
    a.smart_sync(false).await.unwrap();

    b.smart_sync(false).await.unwrap();
    assert!(!b.cfg().vault_dir.join("doomed.md").exists());
    assert!(!b.index().contains("doomed.md"));

    // Trash holds the bytes.
    let trash: Vec<_> = std::fs::read_dir(b.cfg().vault_dir.join(".trash"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(trash.len(), 1);
    assert_eq!(std::fs::read(trash[0].path()).unwrap(), b"bytes\n");
}

/// Upload failures leave the path dirty for the next round (P4).
#[tokio::test]
async fn failed_upload_stays_dirty_for_retry() {
    let (remote, cloud) = Remote::memory();
    let mut a = device("s6", remote.clone(), ConflictStrategy::SmartMerge);

    write_note(&a, "flaky.md", "payload\n");
    a.apply_event(&VaultEvent::Created("flaky.md".into()));

    cloud.fail_next_uploads(1);
    a.smart_sync(false).await.unwrap();
    assert!(a.dirty().is_dirty("flaky.md"), "failed upload must stay dirty");

    a.smart_sync(false).await.unwrap();
    assert!(!a.dirty().is_dirty("flaky.md"));
    assert_eq!(cloud.bytes_at("flaky.md").unwrap(), b"payload\n");
}

/// Renames drop never-synced names and propagate both ends for synced ones.
#[tokio::test]
async fn rename_moves_content_remotely() {
    let (remote, cloud) = Remote::memory();
    let mut a = device("s7", remote.clone(), ConflictStrategy::SmartMerge);

    write_note(&a, "old.md", "kept content\n");
    a.apply_event(&VaultEvent::Created("old.md".into()));
    a.smart_sync(false).await.unwrap();
    assert!(cloud.bytes_at("old.md").is_some());

    std::fs::rename(
        a.cfg().vault_dir.join("old.md"),
        a.cfg().vault_dir.join("new.md"),
    )
    .unwrap();
    a.apply_event(&VaultEvent::Renamed {
        from: "old.md".into(),
        to: "new.md".into(),
    });
    a.smart_sync(false).await.unwrap();

    assert!(cloud.bytes_at("old.md").is_none());
    assert_eq!(cloud.bytes_at("new.md").unwrap(), b"kept content\n");
    assert!(!a.index().contains("old.md"));
    assert!(a.index().contains("new.md"));
}
