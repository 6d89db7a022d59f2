use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::remote::CloudFile;
use crate::vfs::FileStat;

/// Files reconciled per cooperative full-scan chunk.
pub const SCAN_CHUNK_SIZE: usize = 10;

/// A paused scan older than this is discarded instead of resumed.
pub const SCAN_STALENESS: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    SmartSyncing,
    FullScanning,
    Paused,
}

/// Resumable snapshot of an in-flight full scan. The cached listings are
/// only trustworthy within the staleness window.
pub struct FullScanProgress {
    pub cursor: usize,
    pub paths: Vec<String>,
    pub cached_local: HashMap<String, FileStat>,
    pub cached_remote: HashMap<String, CloudFile>,
    pub started_at: Instant,
}

impl FullScanProgress {
    pub fn total_files(&self) -> usize {
        self.paths.len()
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    pub fn is_stale_at(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) > SCAN_STALENESS
    }
}

/// Outcome of a smart-sync request: lead a fresh run, or fold into the
/// one already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTicket {
    Lead,
    Join,
}

/// Serializes the engine's modes. Exactly one of {smart sync, full scan}
/// runs at a time; a smart-sync request preempts a running scan at its
/// next chunk boundary via the shared interrupt flag.
pub struct Scheduler {
    state: SchedulerState,
    interrupt: Arc<AtomicBool>,
    progress: Option<FullScanProgress>,
    sync_pending: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
            interrupt: Arc::new(AtomicBool::new(false)),
            progress: None,
            sync_pending: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn should_interrupt(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn has_paused_scan(&self) -> bool {
        self.progress.is_some()
    }

    /// Register intent to smart-sync. Requests arriving while one is
    /// pending or running fold into it; this includes the window between
    /// a scan pausing and the leader promoting to `SmartSyncing`.
    pub fn request_smart_sync(&mut self) -> SyncTicket {
        if self.sync_pending {
            return SyncTicket::Join;
        }
        self.sync_pending = true;
        if self.state == SchedulerState::FullScanning {
            self.interrupt.store(true, Ordering::SeqCst);
        }
        SyncTicket::Lead
    }

    /// Promote the pending request to the running state. Callable from
    /// `Idle`, `Paused`, or `FullScanning` (the scan is never mid-chunk
    /// when the single engine task reaches this point).
    pub fn begin_smart_sync(&mut self) -> Result<()> {
        match self.state {
            SchedulerState::SmartSyncing => {
                anyhow::bail!("smart sync already running");
            }
            SchedulerState::Idle | SchedulerState::Paused | SchedulerState::FullScanning => {
                self.sync_pending = true;
                self.state = SchedulerState::SmartSyncing;
                Ok(())
            }
        }
    }

    pub fn finish_smart_sync(&mut self) {
        self.sync_pending = false;
        self.interrupt.store(false, Ordering::SeqCst);
        self.state = if self.progress.is_some() {
            SchedulerState::Paused
        } else {
            SchedulerState::Idle
        };
    }

    /// Enter `FullScanning`, handing back non-stale paused progress for
    /// the scan to resume from.
    pub fn begin_full_scan(&mut self) -> Result<Option<FullScanProgress>> {
        match self.state {
            SchedulerState::Idle | SchedulerState::Paused => {}
            other => anyhow::bail!("cannot start full scan while {other:?}"),
        }
        let resume = match self.progress.take() {
            Some(p) if !p.is_stale() => Some(p),
            _ => None, // stale cached lists are discarded
        };
        self.state = SchedulerState::FullScanning;
        Ok(resume)
    }

    pub fn pause_full_scan(&mut self, progress: FullScanProgress) {
        self.progress = Some(progress);
        self.interrupt.store(false, Ordering::SeqCst);
        self.state = SchedulerState::Paused;
    }

    pub fn complete_full_scan(&mut self) {
        self.progress = None;
        self.interrupt.store(false, Ordering::SeqCst);
        self.state = SchedulerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(cursor: usize, started_at: Instant) -> FullScanProgress {
        FullScanProgress {
            cursor,
            paths: (0..100).map(|i| format!("f{i}.md")).collect(),
            cached_local: HashMap::new(),
            cached_remote: HashMap::new(),
            started_at,
        }
    }

    #[test]
    fn smart_sync_round_trip() {
        let mut s = Scheduler::new();
        assert_eq!(s.request_smart_sync(), SyncTicket::Lead);
        s.begin_smart_sync().unwrap();
        assert_eq!(s.state(), SchedulerState::SmartSyncing);
        assert!(s.begin_smart_sync().is_err());
        s.finish_smart_sync();
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[test]
    fn concurrent_requests_fold() {
        let mut s = Scheduler::new();
        assert_eq!(s.request_smart_sync(), SyncTicket::Lead);
        assert_eq!(s.request_smart_sync(), SyncTicket::Join);
        s.begin_smart_sync().unwrap();
        assert_eq!(s.request_smart_sync(), SyncTicket::Join);
        s.finish_smart_sync();
        assert_eq!(s.request_smart_sync(), SyncTicket::Lead);
    }

    #[test]
    fn sync_request_interrupts_running_scan() {
        let mut s = Scheduler::new();
        s.begin_full_scan().unwrap();
        assert_eq!(s.state(), SchedulerState::FullScanning);
        assert!(!s.should_interrupt());

        assert_eq!(s.request_smart_sync(), SyncTicket::Lead);
        assert!(s.should_interrupt());

        // The scan observes the flag at a chunk boundary and pauses.
        s.pause_full_scan(progress(30, Instant::now()));
        assert_eq!(s.state(), SchedulerState::Paused);
        assert!(!s.should_interrupt());

        // A second requester between pause and promotion still folds.
        assert_eq!(s.request_smart_sync(), SyncTicket::Join);

        s.begin_smart_sync().unwrap();
        s.finish_smart_sync();
        // Paused progress keeps the scheduler out of Idle.
        assert_eq!(s.state(), SchedulerState::Paused);
    }

    #[test]
    fn paused_scan_resumes_with_cursor() {
        let mut s = Scheduler::new();
        s.begin_full_scan().unwrap();
        s.pause_full_scan(progress(30, Instant::now()));

        let resumed = s.begin_full_scan().unwrap().expect("progress kept");
        assert_eq!(resumed.cursor, 30);
        s.complete_full_scan();
        assert_eq!(s.state(), SchedulerState::Idle);
        assert!(!s.has_paused_scan());
    }

    #[test]
    fn stale_progress_is_discarded() {
        let started = Instant::now();
        let p = progress(30, started);
        assert!(!p.is_stale_at(started + Duration::from_secs(60)));
        assert!(p.is_stale_at(started + SCAN_STALENESS + Duration::from_secs(1)));
    }

    #[test]
    fn full_scan_cannot_start_during_sync() {
        let mut s = Scheduler::new();
        s.begin_smart_sync().unwrap();
        assert!(s.begin_full_scan().is_err());
    }
}
