use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

pub const USER_IGNORE_FILE: &str = ".vaultsyncignore";

const DEFAULT_IGNORE_LINES: &[&str] = &[
    // engine internals
    ".trash/",
    ".vaultsync/logs/",
    ".vaultsync/*.lock",
    ".vaultsync/index.json_raw",
    ".vaultsync/communication.json", // remote-only merge coordination

    "**/.*.tmp-*", // staged download temp files
    "**/*.tmp-*",
    "*.tmp",
    // VCS and editors
    ".git",
    ".vscode",
    ".idea",
    // OS litter
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
];

/// Gitignore-syntax matcher over vault-relative paths: built-in defaults
/// plus an optional user `.vaultsyncignore` at the vault root.
#[derive(Clone)]
pub struct SyncFilters {
    #[allow(dead_code)]
    vault_root: PathBuf,
    ignore: Gitignore,
}

impl SyncFilters {
    pub fn load(vault_root: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(vault_root);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let ignore_path = vault_root.join(USER_IGNORE_FILE);
        if ignore_path.exists() {
            for line in read_ignore_file(&ignore_path)? {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add {USER_IGNORE_FILE} line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            vault_root: vault_root.to_path_buf(),
            ignore,
        })
    }

    pub fn should_ignore(&self, rel_path: &str, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(Path::new(rel_path), is_dir)
            .is_ignore()
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
