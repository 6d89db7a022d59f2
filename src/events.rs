use tokio::sync::mpsc;

/// Filesystem notifications delivered by the host or the built-in watcher.
/// Paths are vault-relative and forward-slash-delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
    FolderDeleted(String),
    FolderRenamed { from: String, to: String },
}

impl VaultEvent {
    /// Primary path the event is about (the new name for renames).
    pub fn path(&self) -> &str {
        match self {
            VaultEvent::Created(p)
            | VaultEvent::Modified(p)
            | VaultEvent::Deleted(p)
            | VaultEvent::FolderDeleted(p) => p,
            VaultEvent::Renamed { to, .. } | VaultEvent::FolderRenamed { to, .. } => to,
        }
    }
}

pub type EventSender = mpsc::Sender<VaultEvent>;
pub type EventReceiver = mpsc::Receiver<VaultEvent>;

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}
