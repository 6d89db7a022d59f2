mod codec;
mod config;
mod conflict;
mod crypto;
mod dirty;
mod engine;
mod errors;
mod events;
mod filters;
mod history;
mod index;
mod logging;
mod merge;
mod pipeline;
mod reconcile;
mod remote;
mod scheduler;
mod vault_lock;
mod vfs;
mod watcher;
mod workspace;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use config::{Config, ConfigOverrides, CONFIG_DIR};
use conflict::ConflictStrategy;
use engine::Engine;
use remote::Remote;
use vault_lock::{CipherBoundary, Keychain};
use vfs::DiskVfs;

const LOCK_FILE_NAME: &str = "vault.lock";

#[derive(Parser, Debug)]
#[command(name = "vaultsync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Vault directory override (takes precedence over env/config)
    #[arg(long = "vault-dir")]
    vault_dir: Option<PathBuf>,

    /// Transfer concurrency override
    #[arg(long = "concurrency")]
    concurrency: Option<usize>,

    /// Conflict strategy override (smart-merge, always-fork, force-local, force-remote)
    #[arg(long = "strategy")]
    strategy: Option<ConflictStrategy>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync cycle (uses the built-in in-memory remote; wire a real
    /// adapter through the library API)
    Sync {
        /// Also walk the whole vault for changes missed while offline
        #[arg(long = "full", default_value_t = false)]
        full: bool,
    },

    /// Run the watcher-driven daemon loop until interrupted
    Daemon,

    /// Run a resumable full scan over local and remote listings
    FullScan,

    /// Print index and dirty-set counters
    Status,

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,

    /// End-to-end-encryption key management
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
}

#[derive(Subcommand, Debug)]
enum VaultCommands {
    /// Create a fresh master key and write the lock file
    Init {
        #[arg(long = "password")]
        password: String,
    },

    /// Rewrap the master key under a new password
    Rotate {
        #[arg(long = "password")]
        password: String,
        #[arg(long = "new-password")]
        new_password: String,
    },

    /// Print the recovery code for the unlocked master key
    ExportRecovery {
        #[arg(long = "password")]
        password: String,
    },

    /// Rebuild the lock file from a recovery code
    Recover {
        #[arg(long = "code")]
        code: String,
        #[arg(long = "new-password")]
        new_password: String,
    },

    /// Print the key fingerprint
    Fingerprint {
        #[arg(long = "password")]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = Config::resolve_config_path(cli.config.as_deref());
    let overrides = ConfigOverrides {
        vault_dir: cli.vault_dir.clone(),
        concurrency: cli.concurrency,
        strategy: cli.strategy,
        ..Default::default()
    };
    let cfg = Config::load_with_overrides(&config_path, overrides)?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Sync { full } => {
            let mut engine = build_engine(&cfg)?;
            engine.smart_sync(full).await?;
            print_status(&engine);
            Ok(())
        }
        Commands::Daemon => run_daemon(cfg).await,
        Commands::FullScan => {
            let mut engine = build_engine(&cfg)?;
            engine.full_scan().await?;
            print_status(&engine);
            Ok(())
        }
        Commands::Status => {
            let engine = build_engine(&cfg)?;
            print_status(&engine);
            Ok(())
        }
        Commands::ConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        Commands::Version => {
            println!("vaultsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Vault { command } => run_vault_command(&cfg, command),
    }
}

fn build_engine(cfg: &Config) -> Result<Engine> {
    workspace::ensure_vault_layout(&cfg.vault_dir)?;
    logging::init_log_file(
        &cfg.vault_dir
            .join(CONFIG_DIR)
            .join("logs")
            .join("vaultsync.log"),
    )?;
    cfg.save()?;

    let cipher = if cfg.e2ee {
        let keychain = unlock_from_env(cfg)?;
        CipherBoundary::enabled(Arc::new(Mutex::new(keychain)))
    } else {
        CipherBoundary::disabled()
    };

    let (remote, _cloud) = Remote::memory();
    let vfs = Arc::new(DiskVfs::new(&cfg.vault_dir));
    Engine::new(cfg.clone(), vfs, remote, cipher)
}

fn unlock_from_env(cfg: &Config) -> Result<Keychain> {
    let password =
        std::env::var("VAULTSYNC_PASSWORD").context("VAULTSYNC_PASSWORD is required with e2ee")?;
    let blob = std::fs::read_to_string(lock_file_path(cfg)).context("read vault lock file")?;
    let mut keychain = Keychain::new();
    keychain.unlock_vault(blob.trim(), &password)?;
    Ok(keychain)
}

async fn run_daemon(cfg: Config) -> Result<()> {
    workspace::ensure_vault_layout(&cfg.vault_dir)?;
    let _lock = workspace::VaultLock::try_lock(&cfg.vault_dir)?;

    let mut engine = build_engine(&cfg)?;
    logging::info_kv(
        "daemon start",
        &[
            ("version", env!("CARGO_PKG_VERSION")),
            ("vault", &cfg.vault_dir.display().to_string()),
        ],
    );

    let (tx, rx) = events::channel(256);
    let _watcher = watcher::spawn(&cfg.vault_dir, tx)?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_waiters();
    });

    engine.run(rx, shutdown).await
}

fn run_vault_command(cfg: &Config, command: VaultCommands) -> Result<()> {
    workspace::ensure_vault_layout(&cfg.vault_dir)?;
    let lock_path = lock_file_path(cfg);

    match command {
        VaultCommands::Init { password } => {
            validate_password(&password)?;
            if lock_path.exists() {
                anyhow::bail!("lock file already exists at {}", lock_path.display());
            }
            let mut keychain = Keychain::new();
            let blob = keychain.initialize_new_vault(&password)?;
            std::fs::write(&lock_path, &blob)
                .with_context(|| format!("write {}", lock_path.display()))?;
            println!("vault initialized, fingerprint {}", keychain.key_fingerprint()?);
            Ok(())
        }
        VaultCommands::Rotate {
            password,
            new_password,
        } => {
            validate_password(&new_password)?;
            let keychain = unlock(&lock_path, &password)?;
            let blob = keychain.update_password(&new_password)?;
            std::fs::write(&lock_path, &blob)
                .with_context(|| format!("write {}", lock_path.display()))?;
            println!("password rotated");
            Ok(())
        }
        VaultCommands::ExportRecovery { password } => {
            let keychain = unlock(&lock_path, &password)?;
            println!("{}", keychain.export_recovery_code()?);
            Ok(())
        }
        VaultCommands::Recover { code, new_password } => {
            validate_password(&new_password)?;
            let mut keychain = Keychain::new();
            let blob = keychain.recover_from_code(&code, &new_password)?;
            std::fs::write(&lock_path, &blob)
                .with_context(|| format!("write {}", lock_path.display()))?;
            println!(
                "vault recovered, fingerprint {}",
                keychain.key_fingerprint()?
            );
            Ok(())
        }
        VaultCommands::Fingerprint { password } => {
            let keychain = unlock(&lock_path, &password)?;
            println!("{}", keychain.key_fingerprint()?);
            Ok(())
        }
    }
}

fn unlock(lock_path: &std::path::Path, password: &str) -> Result<Keychain> {
    let blob = std::fs::read_to_string(lock_path)
        .with_context(|| format!("read {}", lock_path.display()))?;
    let mut keychain = Keychain::new();
    keychain.unlock_vault(blob.trim(), password)?;
    Ok(keychain)
}

fn lock_file_path(cfg: &Config) -> PathBuf {
    cfg.vault_dir.join(CONFIG_DIR).join(LOCK_FILE_NAME)
}

/// Password policy lives at the input edge: the engine itself accepts any
/// byte string.
fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 {
        anyhow::bail!("password must be at least 8 characters");
    }
    if !password.chars().all(|c| ('\x20'..='\x7e').contains(&c)) {
        anyhow::bail!("password must be printable ascii");
    }
    Ok(())
}

fn print_status(engine: &Engine) {
    let status = engine.status();
    println!(
        "state={:?} indexed={} dirty={} e2ee={} pushed={} pulled={} merges={} forks={}",
        status.state,
        status.indexed_files,
        status.dirty_files,
        status.e2ee,
        status.stats.files_pushed,
        status.stats.files_pulled,
        status.stats.merges,
        status.stats.forks,
    );
}
