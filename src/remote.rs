use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::codec::md5_hex;
use crate::errors::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Folder,
}

/// Remote object metadata as reported by the cloud side.
#[derive(Debug, Clone)]
pub struct CloudFile {
    pub id: String,
    pub path: String,
    /// Milliseconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    pub kind: FileKind,
    pub hash: Option<String>,
}

/// What the adapter can do beyond the required surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub changes_api: bool,
    pub content_hash: bool,
    pub history: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub file_id: String,
    pub path: Option<String>,
    pub removed: bool,
    pub hash: Option<String>,
    pub mtime: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Revision {
    pub id: String,
    /// Milliseconds since the epoch.
    pub modified_time: i64,
    pub size: u64,
    pub author: Option<String>,
    pub keep_forever: bool,
    pub hash: Option<String>,
}

/// Required cloud surface. Network transport, auth and retry live behind
/// implementations of this trait; the engine never talks HTTP itself.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Pre-create application root folders.
    async fn initialize(&self) -> Result<()>;

    async fn is_authenticated(&self) -> bool;

    /// URL the user visits to grant access. Auth flows live in the host;
    /// the engine only refuses to run unauthenticated.
    fn get_auth_url(&self) -> Result<String>;

    async fn handle_callback(&self, url: &str) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    async fn get_file_metadata(&self, path: &str) -> Result<Option<CloudFile>>;

    /// Lookup by id: stronger consistency than a path search.
    async fn get_file_metadata_by_id(
        &self,
        id: &str,
        known_path: Option<&str>,
    ) -> Result<Option<CloudFile>>;

    async fn download_file(&self, id: &str) -> Result<Vec<u8>>;

    async fn upload_file(
        &self,
        path: &str,
        bytes: &[u8],
        mtime: i64,
        existing_id: Option<&str>,
    ) -> Result<CloudFile>;

    /// Rename and/or reparent, preserving revision history.
    async fn move_file(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<CloudFile>;

    async fn delete_file(&self, id: &str) -> Result<()>;

    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String>;

    async fn ensure_folders_exist(&self, paths: &[String]) -> Result<()>;

    async fn file_exists_by_id(&self, id: &str) -> Result<bool>;

    /// Full recursive listing of regular files.
    async fn list_files(&self) -> Result<Vec<CloudFile>>;
}

/// Incremental-changes extension, present when `capabilities().changes_api`.
#[async_trait]
pub trait ChangesCursor: Send + Sync {
    async fn get_start_page_token(&self) -> Result<String>;
    async fn get_changes(&self, token: &str) -> Result<ChangePage>;
}

/// Revision-history extension, present when `capabilities().history`.
#[async_trait]
pub trait Revisions: Send + Sync {
    /// Newest first.
    async fn list_revisions(&self, path: &str) -> Result<Vec<Revision>>;
    async fn get_revision_content(&self, path: &str, rev_id: &str) -> Result<Vec<u8>>;
    async fn set_revision_keep_forever(&self, path: &str, rev_id: &str, keep: bool) -> Result<()>;
    async fn delete_revision(&self, path: &str, rev_id: &str) -> Result<()>;
}

/// An adapter bundle: the required trait plus whichever extensions the
/// adapter implements, discovered through its capability flags.
#[derive(Clone)]
pub struct Remote {
    pub adapter: Arc<dyn CloudAdapter>,
    pub changes: Option<Arc<dyn ChangesCursor>>,
    pub revisions: Option<Arc<dyn Revisions>>,
}

impl Remote {
    pub fn new(
        adapter: Arc<dyn CloudAdapter>,
        changes: Option<Arc<dyn ChangesCursor>>,
        revisions: Option<Arc<dyn Revisions>>,
    ) -> Self {
        Self {
            adapter,
            changes,
            revisions,
        }
    }

    /// Fully in-process remote used by the tests and the offline smoke path.
    pub fn memory() -> (Self, Arc<MemoryCloud>) {
        let cloud = Arc::new(MemoryCloud::default());
        let remote = Self {
            adapter: cloud.clone(),
            changes: Some(cloud.clone()),
            revisions: Some(cloud.clone()),
        };
        (remote, cloud)
    }
}

struct MemFile {
    path: String,
    bytes: Vec<u8>,
    mtime: i64,
    kind: FileKind,
}

struct MemRevision {
    id: String,
    bytes: Vec<u8>,
    mtime: i64,
    keep_forever: bool,
}

#[derive(Default)]
struct MemState {
    files: BTreeMap<String, MemFile>,
    revisions: HashMap<String, Vec<MemRevision>>,
    change_log: Vec<(u64, RemoteChange)>,
    next_seq: u64,
    next_id: u64,
}

impl MemState {
    fn alloc_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{}", self.next_id)
    }

    fn record_change(&mut self, change: RemoteChange) {
        self.next_seq += 1;
        self.change_log.push((self.next_seq, change));
    }

    fn file_by_path(&self, path: &str) -> Option<(&String, &MemFile)> {
        self.files
            .iter()
            .find(|(_, f)| f.kind == FileKind::File && f.path == path)
    }
}

/// In-memory cloud store implementing the full capability surface. Content
/// hashes are MD5 like the real adapters report; every upload appends to
/// the path's revision history.
#[derive(Default)]
pub struct MemoryCloud {
    state: Mutex<MemState>,
    fail_uploads: AtomicUsize,
}

impl MemoryCloud {
    /// Make the next `n` uploads fail, for retry-path tests.
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    /// Raw bytes currently stored at a path, if any.
    pub fn bytes_at(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.file_by_path(path).map(|(_, f)| f.bytes.clone())
    }

    pub fn file_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .files
            .values()
            .filter(|f| f.kind == FileKind::File)
            .count()
    }

    /// Overwrite content at a path, keeping the prior version in the
    /// revision history, the way a foreign device's upload would.
    pub fn force_put(&self, path: &str, bytes: &[u8], mtime: i64) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let hash = md5_hex(bytes);
        let size = bytes.len() as u64;

        let existing = state.file_by_path(path).map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => {
                let file = state.files.get_mut(&id).unwrap();
                let prior_bytes = std::mem::replace(&mut file.bytes, bytes.to_vec());
                let prior_mtime = file.mtime;
                file.mtime = mtime;
                let revs = state.revisions.entry(path.to_string()).or_default();
                let rev_id = format!("{id}-r{}", revs.len() + 1);
                revs.push(MemRevision {
                    id: rev_id,
                    bytes: prior_bytes,
                    mtime: prior_mtime,
                    keep_forever: false,
                });
                id
            }
            None => {
                let id = state.alloc_id();
                state.files.insert(
                    id.clone(),
                    MemFile {
                        path: path.to_string(),
                        bytes: bytes.to_vec(),
                        mtime,
                        kind: FileKind::File,
                    },
                );
                id
            }
        };
        state.record_change(RemoteChange {
            file_id: id,
            path: Some(path.to_string()),
            removed: false,
            hash: Some(hash),
            mtime,
            size,
        });
    }
}

fn cloud_file(id: &str, f: &MemFile) -> CloudFile {
    CloudFile {
        id: id.to_string(),
        path: f.path.clone(),
        mtime: f.mtime,
        size: f.bytes.len() as u64,
        kind: f.kind,
        hash: match f.kind {
            FileKind::File => Some(md5_hex(&f.bytes)),
            FileKind::Folder => None,
        },
    }
}

#[async_trait]
impl CloudAdapter for MemoryCloud {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            changes_api: true,
            content_hash: true,
            history: true,
        }
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        true
    }

    fn get_auth_url(&self) -> Result<String> {
        Err(anyhow!("in-memory remote needs no authorization"))
    }

    async fn handle_callback(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn get_file_metadata(&self, path: &str) -> Result<Option<CloudFile>> {
        let state = self.state.lock().unwrap();
        Ok(state.file_by_path(path).map(|(id, f)| cloud_file(id, f)))
    }

    async fn get_file_metadata_by_id(
        &self,
        id: &str,
        _known_path: Option<&str>,
    ) -> Result<Option<CloudFile>> {
        let state = self.state.lock().unwrap();
        Ok(state.files.get(id).map(|f| cloud_file(id, f)))
    }

    async fn download_file(&self, id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let file = state
            .files
            .get(id)
            .ok_or_else(|| SyncError::RemoteMissing(id.to_string()))?;
        Ok(file.bytes.clone())
    }

    async fn upload_file(
        &self,
        path: &str,
        bytes: &[u8],
        mtime: i64,
        existing_id: Option<&str>,
    ) -> Result<CloudFile> {
        let pending = self.fail_uploads.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_uploads.store(pending - 1, Ordering::SeqCst);
            return Err(anyhow!(SyncError::Network("injected upload failure".into())));
        }

        let mut state = self.state.lock().unwrap();
        let mut id = existing_id.map(|s| s.to_string());
        if id.is_none() {
            id = state.file_by_path(path).map(|(found, _)| found.clone());
        }
        let id = id.unwrap_or_else(|| state.alloc_id());

        let prior = state.files.remove(&id);
        if let Some(prev) = prior {
            let rev_count = state.revisions.get(&prev.path).map_or(0, |v| v.len());
            state
                .revisions
                .entry(prev.path.clone())
                .or_default()
                .push(MemRevision {
                    id: format!("{id}-r{}", rev_count + 1),
                    bytes: prev.bytes,
                    mtime: prev.mtime,
                    keep_forever: false,
                });
        }
        state.files.insert(
            id.clone(),
            MemFile {
                path: path.to_string(),
                bytes: bytes.to_vec(),
                mtime,
                kind: FileKind::File,
            },
        );
        state.record_change(RemoteChange {
            file_id: id.clone(),
            path: Some(path.to_string()),
            removed: false,
            hash: Some(md5_hex(bytes)),
            mtime,
            size: bytes.len() as u64,
        });
        let file = state.files.get(&id).unwrap();
        Ok(cloud_file(&id, file))
    }

    async fn move_file(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<CloudFile> {
        let mut state = self.state.lock().unwrap();
        let old_path = state
            .files
            .get(id)
            .map(|f| f.path.clone())
            .ok_or_else(|| SyncError::RemoteMissing(id.to_string()))?;

        let parent = match new_parent {
            Some(p) => p.trim_end_matches('/').to_string(),
            None => match old_path.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            },
        };
        let new_path = if parent.is_empty() {
            new_name.to_string()
        } else {
            format!("{parent}/{new_name}")
        };

        if let Some(revs) = state.revisions.remove(&old_path) {
            state.revisions.insert(new_path.clone(), revs);
        }
        let (mtime, size, hash) = {
            let file = state.files.get_mut(id).unwrap();
            file.path = new_path.clone();
            (file.mtime, file.bytes.len() as u64, md5_hex(&file.bytes))
        };
        state.record_change(RemoteChange {
            file_id: id.to_string(),
            path: Some(new_path),
            removed: false,
            hash: Some(hash),
            mtime,
            size,
        });
        let file = state.files.get(id).unwrap();
        Ok(cloud_file(id, file))
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.files.remove(id) {
            state.revisions.remove(&file.path);
            state.record_change(RemoteChange {
                file_id: id.to_string(),
                path: Some(file.path),
                removed: true,
                hash: None,
                mtime: file.mtime,
                size: 0,
            });
        }
        Ok(())
    }

    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let path = match parent {
            Some(p) if !p.is_empty() => format!("{}/{name}", p.trim_end_matches('/')),
            _ => name.to_string(),
        };
        if let Some((id, _)) = state
            .files
            .iter()
            .find(|(_, f)| f.kind == FileKind::Folder && f.path == path)
        {
            return Ok(id.clone());
        }
        let id = state.alloc_id();
        state.files.insert(
            id.clone(),
            MemFile {
                path,
                bytes: Vec::new(),
                mtime: 0,
                kind: FileKind::Folder,
            },
        );
        Ok(id)
    }

    async fn ensure_folders_exist(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            let mut parent: Option<String> = None;
            for seg in path.split('/').filter(|s| !s.is_empty()) {
                self.create_folder(seg, parent.as_deref()).await?;
                parent = Some(match parent {
                    Some(p) => format!("{p}/{seg}"),
                    None => seg.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn file_exists_by_id(&self, id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.files.contains_key(id))
    }

    async fn list_files(&self) -> Result<Vec<CloudFile>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .iter()
            .filter(|(_, f)| f.kind == FileKind::File)
            .map(|(id, f)| cloud_file(id, f))
            .collect())
    }
}

#[async_trait]
impl ChangesCursor for MemoryCloud {
    async fn get_start_page_token(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        Ok(state.next_seq.to_string())
    }

    async fn get_changes(&self, token: &str) -> Result<ChangePage> {
        let since: u64 = token
            .parse()
            .map_err(|_| anyhow!("bad change token: {token}"))?;
        let state = self.state.lock().unwrap();
        let changes = state
            .change_log
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, c)| c.clone())
            .collect();
        Ok(ChangePage {
            changes,
            next_page_token: None,
            new_start_page_token: Some(state.next_seq.to_string()),
        })
    }
}

#[async_trait]
impl Revisions for MemoryCloud {
    async fn list_revisions(&self, path: &str) -> Result<Vec<Revision>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        // The current head counts as the newest revision.
        if let Some((id, f)) = state.file_by_path(path) {
            out.push(Revision {
                id: format!("{id}-head"),
                modified_time: f.mtime,
                size: f.bytes.len() as u64,
                author: None,
                keep_forever: false,
                hash: Some(md5_hex(&f.bytes)),
            });
        }
        if let Some(revs) = state.revisions.get(path) {
            for rev in revs.iter().rev() {
                out.push(Revision {
                    id: rev.id.clone(),
                    modified_time: rev.mtime,
                    size: rev.bytes.len() as u64,
                    author: None,
                    keep_forever: rev.keep_forever,
                    hash: Some(md5_hex(&rev.bytes)),
                });
            }
        }
        Ok(out)
    }

    async fn get_revision_content(&self, path: &str, rev_id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if rev_id.ends_with("-head") {
            if let Some((_, f)) = state.file_by_path(path) {
                return Ok(f.bytes.clone());
            }
        }
        state
            .revisions
            .get(path)
            .and_then(|revs| revs.iter().find(|r| r.id == rev_id))
            .map(|r| r.bytes.clone())
            .ok_or_else(|| SyncError::RemoteMissing(format!("{path}@{rev_id}")).into())
    }

    async fn set_revision_keep_forever(&self, path: &str, rev_id: &str, keep: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let rev = state
            .revisions
            .get_mut(path)
            .and_then(|revs| revs.iter_mut().find(|r| r.id == rev_id))
            .ok_or_else(|| SyncError::RemoteMissing(format!("{path}@{rev_id}")))?;
        rev.keep_forever = keep;
        Ok(())
    }

    async fn delete_revision(&self, path: &str, rev_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(revs) = state.revisions.get_mut(path) {
            revs.retain(|r| r.id != rev_id);
        }
        Ok(())
    }
}
