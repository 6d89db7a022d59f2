use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategy;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Vault-relative home of the engine's own files.
pub const CONFIG_DIR: &str = ".vaultsync";
/// Vault-relative path of the synchronized index document.
pub const INDEX_PATH: &str = ".vaultsync/index.json";

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    vault_dir: Option<PathBuf>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    strategy: Option<ConflictStrategy>,
    #[serde(default)]
    e2ee: Option<bool>,
    #[serde(default)]
    sync_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub vault_dir: PathBuf,
    pub device_id: String,
    pub concurrency: usize,
    pub strategy: ConflictStrategy,
    pub e2ee: bool,
    pub sync_interval_secs: u64,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub vault_dir: Option<PathBuf>,
    pub device_id: Option<String>,
    pub concurrency: Option<usize>,
    pub strategy: Option<ConflictStrategy>,
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".vaultsync").join("logs").join("vaultsync.log")
}

impl Config {
    pub fn default_vault_dir() -> PathBuf {
        home_dir().join("Vault")
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".vaultsync").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("VAULTSYNC_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        let candidates = [
            Self::default_config_path(),
            home_dir()
                .join(".config")
                .join("vaultsync")
                .join("config.json"),
        ];
        for p in candidates {
            if p.exists() {
                return absolutize_path(&p);
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).context("parse config json")?
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let vault_dir = overrides
            .vault_dir
            .or(env_cfg.vault_dir)
            .or(file_cfg.vault_dir)
            .unwrap_or_else(Self::default_vault_dir);
        let device_id = overrides
            .device_id
            .or(env_cfg.device_id)
            .or(file_cfg.device_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().as_simple().to_string());
        let concurrency = overrides
            .concurrency
            .or(env_cfg.concurrency)
            .or(file_cfg.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        let strategy = overrides
            .strategy
            .or(env_cfg.strategy)
            .or(file_cfg.strategy)
            .unwrap_or_default();
        let e2ee = env_cfg.e2ee.or(file_cfg.e2ee).unwrap_or(false);
        let sync_interval_secs = env_cfg
            .sync_interval_secs
            .or(file_cfg.sync_interval_secs)
            .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);

        let mut cfg = Config {
            vault_dir,
            device_id,
            concurrency,
            strategy,
            e2ee,
            sync_interval_secs,
            config_path: Some(absolutize_path(path)),
        };
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        self.vault_dir = absolutize_path(&self.vault_dir);
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            anyhow::bail!("device_id is empty");
        }
        if self.vault_dir.as_os_str().is_empty() {
            anyhow::bail!("vault_dir is empty");
        }
        Ok(())
    }

    /// Persist the resolved settings (device id included) so every run of
    /// this installation announces the same identity.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.config_path.as_ref() else {
            anyhow::bail!("config has no backing path");
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self).context("encode config")?;
        std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

fn read_env_config() -> PartialConfig {
    let mut cfg = PartialConfig::default();
    if let Ok(v) = std::env::var("VAULTSYNC_VAULT_DIR") {
        if !v.trim().is_empty() {
            cfg.vault_dir = Some(PathBuf::from(v.trim()));
        }
    }
    if let Ok(v) = std::env::var("VAULTSYNC_DEVICE_ID") {
        if !v.trim().is_empty() {
            cfg.device_id = Some(v.trim().to_string());
        }
    }
    if let Ok(v) = std::env::var("VAULTSYNC_CONCURRENCY") {
        cfg.concurrency = v.trim().parse().ok();
    }
    if let Ok(v) = std::env::var("VAULTSYNC_STRATEGY") {
        cfg.strategy = v.trim().parse().ok();
    }
    if let Ok(v) = std::env::var("VAULTSYNC_E2EE") {
        let v = v.trim().to_lowercase();
        cfg.e2ee = Some(v == "1" || v == "true");
    }
    if let Ok(v) = std::env::var("VAULTSYNC_SYNC_INTERVAL_SECS") {
        cfg.sync_interval_secs = v.trim().parse().ok();
    }
    cfg
}

pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        if !profile.trim().is_empty() {
            return PathBuf::from(profile);
        }
    }
    PathBuf::from(".")
}

fn absolutize_path(p: &Path) -> PathBuf {
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Lexical cleanup only; no filesystem access.
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
