use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::errors::SyncError;

/// What produced the current entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastAction {
    Pull,
    Push,
    Merge,
}

/// Per-path sync metadata. `hash` is the lower-case hex MD5 of the bytes
/// last observed equal between local and remote; `ancestor_hash` is the
/// merge-base candidate and only ever advances to a hash confirmed shared
/// on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub mtime: i64,
    pub size: u64,
    pub hash: String,
    #[serde(rename = "ancestorHash", skip_serializing_if = "Option::is_none", default)]
    pub ancestor_hash: Option<String>,
    #[serde(rename = "lastAction")]
    pub last_action: LastAction,
}

/// Wire and on-disk document shape. The document is itself a synchronized
/// file: its own path is a key in `index`, and that entry records the hash
/// of the *uploaded* bytes rather than anything recomputable from disk.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IndexDoc {
    pub index: BTreeMap<String, IndexEntry>,
    #[serde(rename = "startPageToken", default)]
    pub start_page_token: Option<String>,
}

impl IndexDoc {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let plain = codec::maybe_gunzip(bytes)?;
        serde_json::from_slice(&plain).context("parse index document")
    }
}

/// Persistent path → entry map with a durable save and a `_raw` recovery
/// sibling.
pub struct SyncIndex {
    disk_path: PathBuf,
    doc: IndexDoc,
}

impl SyncIndex {
    /// Load the canonical file, transparently decompressing gzip payloads;
    /// fall back to the raw sibling; start empty when both are unreadable.
    pub fn load(disk_path: &Path) -> Self {
        let doc = read_doc(disk_path)
            .or_else(|| read_doc(&raw_sibling(disk_path)))
            .unwrap_or_default();
        Self {
            disk_path: disk_path.to_path_buf(),
            doc,
        }
    }

    /// Durable save: canonical JSON via tmp + rename, then the uncompressed
    /// raw sibling.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.disk_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(&self.doc).context("encode index")?;

        let tmp = self.disk_path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.disk_path)
            .with_context(|| format!("rename into {}", self.disk_path.display()))?;

        let raw = raw_sibling(&self.disk_path);
        fs::write(&raw, &data).with_context(|| format!("write {}", raw.display()))?;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.doc = IndexDoc::default();
    }

    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.doc.index.get(path)
    }

    pub fn put(&mut self, path: &str, entry: IndexEntry) {
        self.doc.index.insert(path.to_string(), entry);
    }

    pub fn delete(&mut self, path: &str) {
        self.doc.index.remove(path);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.doc.index.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.doc.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.index.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.doc.index.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.doc.index.iter()
    }

    /// Paths under a folder prefix (`notes/` matches `notes/a.md` but not
    /// `notes2/a.md`).
    pub fn paths_with_prefix(&self, folder: &str) -> Vec<String> {
        let prefix = if folder.ends_with('/') {
            folder.to_string()
        } else {
            format!("{folder}/")
        };
        self.doc
            .index
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn start_page_token(&self) -> Option<&str> {
        self.doc.start_page_token.as_deref()
    }

    pub fn set_start_page_token(&mut self, token: Option<String>) {
        self.doc.start_page_token = token;
    }

    /// Gzipped JSON, the representation uploaded to the remote.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        let data = serde_json::to_vec(&self.doc).context("encode index")?;
        codec::gzip(&data)
    }

    pub fn to_raw_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.doc).context("encode index")
    }

    /// Guards a full-index replace driven by a freshly downloaded remote
    /// index. Never deletes anything itself; callers must not act on the
    /// remote document when this errors.
    pub fn check_remote_replace(
        &self,
        remote: &BTreeMap<String, IndexEntry>,
        remote_payload_len: usize,
        own_path: &str,
    ) -> Result<()> {
        let local: Vec<&String> = self
            .doc
            .index
            .keys()
            .filter(|p| p.as_str() != own_path)
            .collect();

        if remote.is_empty() && local.len() > 20 {
            return Err(SyncError::SafetyHalt(format!(
                "remote index is empty but {} local files are indexed",
                local.len()
            ))
            .into());
        }

        if !remote.is_empty() && remote_payload_len > 200 && !local.is_empty() {
            let removed = local
                .iter()
                .filter(|p| !remote.contains_key(p.as_str()))
                .count();
            if removed * 2 > local.len() {
                return Err(SyncError::RemoteCorruption(format!(
                    "remote index would remove {removed} of {} local paths",
                    local.len()
                ))
                .into());
            }
        }

        Ok(())
    }
}

fn raw_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "index.json".to_string());
    path.with_file_name(format!("{name}_raw"))
}

fn read_doc(path: &Path) -> Option<IndexDoc> {
    let bytes = fs::read(path).ok()?;
    IndexDoc::parse(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::sync_error_kind;
    use std::time::SystemTime;

    fn make_temp_dir() -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("vaultsync-index-test-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn entry(hash: &str) -> IndexEntry {
        IndexEntry {
            file_id: format!("id-{hash}"),
            mtime: 1_700_000_000_000,
            size: 10,
            hash: hash.to_string(),
            ancestor_hash: None,
            last_action: LastAction::Push,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = make_temp_dir();
        let path = dir.join("index.json");

        let mut idx = SyncIndex::load(&path);
        assert!(idx.is_empty());
        idx.put("notes/a.md", entry("aaaa"));
        idx.set_start_page_token(Some("tok-1".into()));
        idx.save().unwrap();

        let again = SyncIndex::load(&path);
        assert_eq!(again.len(), 1);
        assert_eq!(again.get("notes/a.md").unwrap().hash, "aaaa");
        assert_eq!(again.start_page_token(), Some("tok-1"));
        assert!(dir.join("index.json_raw").exists());
    }

    #[test]
    fn load_detects_gzip_by_magic() {
        let dir = make_temp_dir();
        let path = dir.join("index.json");

        let mut idx = SyncIndex::load(&path);
        idx.put("a.md", entry("ffff"));
        let wire = idx.to_wire_bytes().unwrap();
        fs::write(&path, &wire).unwrap();

        let again = SyncIndex::load(&path);
        assert_eq!(again.get("a.md").unwrap().hash, "ffff");
    }

    #[test]
    fn load_falls_back_to_raw_sibling() {
        let dir = make_temp_dir();
        let path = dir.join("index.json");

        let mut idx = SyncIndex::load(&path);
        idx.put("a.md", entry("1111"));
        idx.save().unwrap();

        fs::write(&path, b"{ not json").unwrap();
        let again = SyncIndex::load(&path);
        assert_eq!(again.get("a.md").unwrap().hash, "1111");
    }

    #[test]
    fn load_starts_empty_when_both_unreadable() {
        let dir = make_temp_dir();
        let path = dir.join("index.json");
        fs::write(&path, b"junk").unwrap();
        fs::write(dir.join("index.json_raw"), b"more junk").unwrap();
        assert!(SyncIndex::load(&path).is_empty());
    }

    #[test]
    fn prefix_listing_respects_folder_boundaries() {
        let dir = make_temp_dir();
        let mut idx = SyncIndex::load(&dir.join("index.json"));
        idx.put("notes/a.md", entry("a"));
        idx.put("notes/sub/b.md", entry("b"));
        idx.put("notes2/c.md", entry("c"));

        let under = idx.paths_with_prefix("notes");
        assert_eq!(under, vec!["notes/a.md".to_string(), "notes/sub/b.md".to_string()]);
    }

    #[test]
    fn empty_remote_with_many_local_files_halts() {
        let dir = make_temp_dir();
        let mut idx = SyncIndex::load(&dir.join("index.json"));
        for i in 0..25 {
            idx.put(&format!("f{i}.md"), entry(&format!("h{i}")));
        }

        let remote = BTreeMap::new();
        let err = idx
            .check_remote_replace(&remote, 100, ".vaultsync/index.json")
            .unwrap_err();
        assert!(matches!(sync_error_kind(&err), Some(SyncError::SafetyHalt(_))));
    }

    #[test]
    fn majority_removal_is_remote_corruption() {
        let dir = make_temp_dir();
        let mut idx = SyncIndex::load(&dir.join("index.json"));
        for i in 0..10 {
            idx.put(&format!("f{i}.md"), entry(&format!("h{i}")));
        }

        // Remote kept only two of the ten paths.
        let mut remote = BTreeMap::new();
        remote.insert("f0.md".to_string(), entry("h0"));
        remote.insert("f1.md".to_string(), entry("h1"));

        let err = idx
            .check_remote_replace(&remote, 500, ".vaultsync/index.json")
            .unwrap_err();
        assert!(matches!(
            sync_error_kind(&err),
            Some(SyncError::RemoteCorruption(_))
        ));
    }

    #[test]
    fn small_removal_passes_guard() {
        let dir = make_temp_dir();
        let mut idx = SyncIndex::load(&dir.join("index.json"));
        for i in 0..10 {
            idx.put(&format!("f{i}.md"), entry(&format!("h{i}")));
        }

        let mut remote = BTreeMap::new();
        for i in 0..9 {
            remote.insert(format!("f{i}.md"), entry(&format!("h{i}")));
        }
        idx.check_remote_replace(&remote, 500, ".vaultsync/index.json")
            .unwrap();
    }
}
