use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::CONFIG_DIR;
use crate::vfs::TRASH_DIR;

#[derive(Debug)]
pub struct VaultLockedError;

impl std::fmt::Display for VaultLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vault locked by another vaultsync process")
    }
}

impl std::error::Error for VaultLockedError {}

/// Single-instance guard over a vault directory. Held for the process
/// lifetime; releasing happens on drop.
#[derive(Debug)]
pub struct VaultLock {
    file: fs::File,
    path: PathBuf,
}

/// Create the on-disk skeleton the engine expects inside a vault.
pub fn ensure_vault_layout(vault_dir: &Path) -> Result<()> {
    let config_dir = vault_dir.join(CONFIG_DIR);
    let logs_dir = config_dir.join("logs");
    let trash_dir = vault_dir.join(TRASH_DIR);

    fs::create_dir_all(&config_dir)
        .with_context(|| format!("create {}", config_dir.display()))?;
    fs::create_dir_all(&logs_dir).with_context(|| format!("create {}", logs_dir.display()))?;
    fs::create_dir_all(&trash_dir)
        .with_context(|| format!("create {}", trash_dir.display()))?;
    Ok(())
}

impl VaultLock {
    pub fn try_lock(vault_dir: &Path) -> Result<Self> {
        let config_dir = vault_dir.join(CONFIG_DIR);
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("create {}", config_dir.display()))?;
        let lock_path = config_dir.join("vaultsync.lock");

        let file = match sys::open(&lock_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(VaultLockedError.into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("open {}", lock_path.display()));
            }
        };
        if !sys::acquire(&file).context("acquire vault lock")? {
            return Err(VaultLockedError.into());
        }

        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

impl Drop for VaultLock {
    fn drop(&mut self) {
        let _ = sys::release(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Advisory file locking. `acquire` answers whether the lock was taken;
/// contention is a normal outcome, not an error.
#[cfg(unix)]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;
    use std::path::Path;

    // Operation bits from <sys/file.h>.
    const EXCLUSIVE_NONBLOCKING: i32 = 0x2 | 0x4;
    const UNLOCK: i32 = 0x8;

    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }

    pub fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    pub fn acquire(file: &File) -> io::Result<bool> {
        match call(file, EXCLUSIVE_NONBLOCKING) {
            Ok(()) => Ok(true),
            Err(err) if is_contention(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn release(file: &File) -> io::Result<()> {
        call(file, UNLOCK)
    }

    fn call(file: &File, operation: i32) -> io::Result<()> {
        if unsafe { flock(file.as_raw_fd(), operation) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn is_contention(err: &io::Error) -> bool {
        // The errno for a held lock is not uniform across unixes: Linux
        // hands back EAGAIN (11), the BSD family EWOULDBLOCK (35).
        err.kind() == io::ErrorKind::WouldBlock
            || matches!(err.raw_os_error(), Some(11) | Some(35))
    }
}

/// Windows has no flock; atomically creating the lock file is itself the
/// mutual exclusion, so `open` failing with `AlreadyExists` means locked.
#[cfg(windows)]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::path::Path;

    pub fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
    }

    pub fn acquire(_file: &File) -> io::Result<bool> {
        Ok(true)
    }

    pub fn release(_file: &File) -> io::Result<()> {
        Ok(())
    }
}
