use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

pub const TRASH_DIR: &str = ".trash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Milliseconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    pub is_dir: bool,
}

/// Filesystem capability surface the engine works against. Paths are
/// vault-relative and forward-slash-delimited.
#[async_trait]
pub trait Vfs: Send + Sync {
    async fn exists(&self, path: &str) -> bool;
    async fn stat(&self, path: &str) -> Result<Option<FileStat>>;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    /// Write, creating parent directories as needed.
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;
    async fn mkdir_all(&self, path: &str) -> Result<()>;
    /// Recursive listing of regular files, excluding the trash area.
    async fn list(&self) -> Result<Vec<(String, FileStat)>>;
    async fn remove(&self, path: &str) -> Result<()>;
    /// Move aside into the trash area instead of unlinking.
    async fn trash(&self, path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Direct `std::fs` implementation rooted at the vault directory.
pub struct DiskVfs {
    root: PathBuf,
}

impl DiskVfs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, rel: &str) -> PathBuf {
        let mut out = self.root.clone();
        for seg in rel.split('/').filter(|s| !s.is_empty() && *s != "..") {
            out.push(seg);
        }
        out
    }
}

#[async_trait]
impl Vfs for DiskVfs {
    async fn exists(&self, path: &str) -> bool {
        self.abs(path).exists()
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        let abs = self.abs(path);
        match fs::metadata(&abs) {
            Ok(meta) => Ok(Some(FileStat {
                mtime: mtime_millis(&meta),
                size: meta.len(),
                is_dir: meta.is_dir(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat {}", abs.display())),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let abs = self.abs(path);
        fs::read(&abs).with_context(|| format!("read {}", abs.display()))
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&abs, bytes).with_context(|| format!("write {}", abs.display()))
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        let abs = self.abs(path);
        fs::create_dir_all(&abs).with_context(|| format!("create {}", abs.display()))
    }

    async fn list(&self) -> Result<Vec<(String, FileStat)>> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name() != TRASH_DIR)
            .filter_map(|e| e.ok())
        {
            let ftype = entry.file_type();
            if ftype.is_dir() || ftype.is_symlink() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .with_context(|| format!("strip prefix {}", entry.path().display()))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let meta = entry.metadata()?;
            out.push((
                key,
                FileStat {
                    mtime: mtime_millis(&meta),
                    size: meta.len(),
                    is_dir: false,
                },
            ));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let abs = self.abs(path);
        if abs.is_dir() {
            fs::remove_dir_all(&abs).with_context(|| format!("remove dir {}", abs.display()))
        } else {
            fs::remove_file(&abs).with_context(|| format!("remove {}", abs.display()))
        }
    }

    async fn trash(&self, path: &str) -> Result<()> {
        let abs = self.abs(path);
        if !abs.exists() {
            return Ok(());
        }
        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let target = self.root.join(TRASH_DIR).join(format!("{stamp}-{name}"));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::rename(&abs, &target)
            .with_context(|| format!("trash {} -> {}", abs.display(), target.display()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.abs(from);
        let dst = self.abs(to);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::rename(&src, &dst)
            .with_context(|| format!("rename {} -> {}", src.display(), dst.display()))
    }
}

fn mtime_millis(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_vfs() -> DiskVfs {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("vaultsync-vfs-test-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        DiskVfs::new(&root)
    }

    #[tokio::test]
    async fn write_read_stat_round_trip() {
        let vfs = make_vfs();
        vfs.write("notes/sub/a.md", b"hello").await.unwrap();
        assert!(vfs.exists("notes/sub/a.md").await);
        assert_eq!(vfs.read("notes/sub/a.md").await.unwrap(), b"hello");

        let stat = vfs.stat("notes/sub/a.md").await.unwrap().unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_dir);
        assert!(vfs.stat("missing.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_skips_trash_and_uses_forward_slashes() {
        let vfs = make_vfs();
        vfs.write("notes/a.md", b"a").await.unwrap();
        vfs.write("b.md", b"b").await.unwrap();
        vfs.write(".trash/20260101-old.md", b"x").await.unwrap();

        let listed = vfs.list().await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b.md", "notes/a.md"]);
    }

    #[tokio::test]
    async fn trash_moves_file_aside() {
        let vfs = make_vfs();
        vfs.write("doomed.md", b"bytes").await.unwrap();
        vfs.trash("doomed.md").await.unwrap();
        assert!(!vfs.exists("doomed.md").await);

        let trash_dir = vfs.root().join(TRASH_DIR);
        let kept: Vec<_> = fs::read_dir(&trash_dir).unwrap().flatten().collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(fs::read(kept[0].path()).unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn rename_creates_target_parents() {
        let vfs = make_vfs();
        vfs.write("a.md", b"1").await.unwrap();
        vfs.rename("a.md", "deep/nested/b.md").await.unwrap();
        assert!(!vfs.exists("a.md").await);
        assert_eq!(vfs.read("deep/nested/b.md").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn abs_refuses_parent_traversal() {
        let vfs = make_vfs();
        vfs.write("../escape.md", b"x").await.unwrap();
        assert!(vfs.root().join("escape.md").exists());
    }
}
