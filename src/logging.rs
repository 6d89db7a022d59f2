//! Key=value logging to the vault's log file, mirrored to stdout.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

static SINK: Mutex<Option<File>> = Mutex::new(None);

#[derive(Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Open (or reuse) the log file. Later calls are no-ops so the daemon and
/// embedded engines cannot fight over the sink.
pub fn init_log_file(path: &Path) -> Result<()> {
    let mut sink = SINK.lock().unwrap();
    if sink.is_some() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    *sink = Some(file);
    Ok(())
}

pub fn init_default_log_file() -> Result<PathBuf> {
    let path = crate::config::default_log_file_path();
    init_log_file(&path)?;
    Ok(path)
}

pub fn info(msg: impl AsRef<str>) {
    emit(Level::Info, msg.as_ref(), &[]);
}

pub fn warn(msg: impl AsRef<str>) {
    emit(Level::Warn, msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    emit(Level::Error, msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, fields: &[(&str, &str)]) {
    emit(Level::Info, msg, fields);
}

fn emit(level: Level, msg: &str, fields: &[(&str, &str)]) {
    let line = render(level, msg, fields);
    println!("{line}");
    if let Ok(mut sink) = SINK.lock() {
        if let Some(file) = sink.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }
}

fn render(level: Level, msg: &str, fields: &[(&str, &str)]) -> String {
    let mut line = String::new();
    let _ = write!(
        line,
        "{} {} msg={:?}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        level.tag(),
        msg,
    );
    for (key, value) in fields {
        let _ = write!(line, " {key}={value}");
    }
    line
}
