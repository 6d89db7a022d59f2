use thiserror::Error;

/// Tagged error kinds surfaced by the engine.
///
/// These are carried inside `anyhow::Error` and recovered with
/// `downcast_ref` where a caller must branch on the kind.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication required")]
    AuthRequired,

    #[error("authentication invalid: {0}")]
    AuthInvalid(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by remote")]
    RateLimited,

    #[error("invalid vault password")]
    InvalidPassword,

    #[error("vault is locked")]
    Locked,

    #[error("revision content hash mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("remote index looks corrupted: {0}")]
    RemoteCorruption(String),

    #[error("refusing destructive sync: {0}")]
    SafetyHalt(String),

    #[error("local file missing: {0}")]
    FileMissing(String),

    #[error("remote object missing: {0}")]
    RemoteMissing(String),
}

impl SyncError {
    /// True for failures that must abort the whole run rather than a
    /// single file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthRequired
                | SyncError::AuthInvalid(_)
                | SyncError::RemoteCorruption(_)
                | SyncError::SafetyHalt(_)
                | SyncError::Locked
        )
    }
}

/// Look for a `SyncError` anywhere in an `anyhow` chain.
pub fn sync_error_kind(err: &anyhow::Error) -> Option<&SyncError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SyncError>())
}
