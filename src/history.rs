use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::codec::md5_hex;
use crate::errors::SyncError;
use crate::remote::{Remote, Revision, Revisions};

/// Facade over the remote's revision history, when the adapter has one.
#[derive(Clone)]
pub struct RevisionLog {
    revisions: Option<Arc<dyn Revisions>>,
}

impl RevisionLog {
    pub fn new(remote: &Remote) -> Self {
        Self {
            revisions: remote.revisions.clone(),
        }
    }

    pub fn available(&self) -> bool {
        self.revisions.is_some()
    }

    fn backend(&self) -> Result<&Arc<dyn Revisions>> {
        self.revisions
            .as_ref()
            .ok_or_else(|| anyhow!("remote does not support revision history"))
    }

    /// Newest first.
    pub async fn list(&self, path: &str) -> Result<Vec<Revision>> {
        self.backend()?.list_revisions(path).await
    }

    /// Fetch revision content, verifying it against the advertised hash
    /// when one is available. A mismatch never reaches the caller's disk.
    pub async fn fetch(&self, path: &str, revision: &Revision) -> Result<Vec<u8>> {
        let bytes = self
            .backend()?
            .get_revision_content(path, &revision.id)
            .await?;
        if let Some(expected) = revision.hash.as_deref() {
            let actual = md5_hex(&bytes);
            if actual != expected {
                return Err(SyncError::Integrity {
                    path: format!("{path}@{}", revision.id),
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }
        Ok(bytes)
    }

    pub async fn pin(&self, path: &str, rev_id: &str, keep: bool) -> Result<()> {
        self.backend()?
            .set_revision_keep_forever(path, rev_id, keep)
            .await
    }

    pub async fn delete(&self, path: &str, rev_id: &str) -> Result<()> {
        self.backend()?.delete_revision(path, rev_id).await
    }
}
