use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::config::{Config, CONFIG_DIR, INDEX_PATH};
use crate::conflict::Resolver;
use crate::dirty::DirtyTracker;
use crate::errors::{sync_error_kind, SyncError};
use crate::events::{EventReceiver, VaultEvent};
use crate::filters::SyncFilters;
use crate::history::RevisionLog;
use crate::index::SyncIndex;
use crate::pipeline::{self, SyncContext, TransferStats};
use crate::reconcile::RemoteState;
use crate::remote::Remote;
use crate::scheduler::{FullScanProgress, Scheduler, SchedulerState, SCAN_CHUNK_SIZE};
use crate::vault_lock::CipherBoundary;
use crate::vfs::Vfs;

/// Progress of one cooperative full-scan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    Continue,
    Paused,
    Completed,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: SchedulerState,
    pub indexed_files: usize,
    pub dirty_files: usize,
    pub e2ee: bool,
    pub stats: TransferStats,
}

/// The one reconciliation engine instance of the process. Owns the index,
/// the dirty tracker and the scheduler; everything mutating sync state
/// flows through `&mut self`, which is the single-writer invariant.
pub struct Engine {
    cfg: Config,
    vfs: Arc<dyn Vfs>,
    remote: Remote,
    history: RevisionLog,
    index: SyncIndex,
    dirty: DirtyTracker,
    filters: SyncFilters,
    cipher: CipherBoundary,
    resolver: Resolver,
    scheduler: Scheduler,
    stats: TransferStats,
    active_scan: Option<FullScanProgress>,
}

impl Engine {
    pub fn new(
        cfg: Config,
        vfs: Arc<dyn Vfs>,
        remote: Remote,
        cipher: CipherBoundary,
    ) -> Result<Self> {
        let filters = SyncFilters::load(&cfg.vault_dir)?;
        let index_disk_path = cfg.vault_dir.join(CONFIG_DIR).join("index.json");
        let index = SyncIndex::load(&index_disk_path);
        let history = RevisionLog::new(&remote);
        let resolver = Resolver::new(cfg.strategy, &cfg.device_id);

        Ok(Self {
            cfg,
            vfs,
            remote,
            history,
            index,
            dirty: DirtyTracker::new(),
            filters,
            cipher,
            resolver,
            scheduler: Scheduler::new(),
            stats: TransferStats::default(),
            active_scan: None,
        })
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.scheduler.state(),
            indexed_files: self.index.len(),
            dirty_files: self.dirty.len(),
            e2ee: self.cipher.is_enabled(),
            stats: self.stats,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn index(&self) -> &SyncIndex {
        &self.index
    }

    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    pub fn apply_event(&mut self, event: &VaultEvent) {
        self.dirty.apply_event(event, &self.index, &self.filters);
    }

    fn ctx(&mut self) -> SyncContext<'_> {
        SyncContext {
            vfs: self.vfs.as_ref(),
            remote: &self.remote,
            history: &self.history,
            index: &mut self.index,
            dirty: &mut self.dirty,
            filters: &self.filters,
            cipher: &self.cipher,
            resolver: &self.resolver,
            concurrency: self.cfg.concurrency,
            index_path: INDEX_PATH,
            stats: &mut self.stats,
        }
    }

    /// One smart-sync run: pull then push. `scan_vault` additionally walks
    /// the whole vault for changes the event stream missed.
    pub async fn smart_sync(&mut self, scan_vault: bool) -> Result<TransferStats> {
        // A scan mid-flight pauses at this boundary; its progress survives
        // in the scheduler for later resumption.
        if let Some(progress) = self.active_scan.take() {
            self.scheduler.pause_full_scan(progress);
        }
        if !self.remote.adapter.is_authenticated().await {
            return Err(SyncError::AuthRequired.into());
        }
        self.scheduler.begin_smart_sync()?;
        let result = async {
            let mut ctx = self.ctx();
            pipeline::smart_pull(&mut ctx).await?;
            pipeline::smart_push(&mut ctx, scan_vault).await
        }
        .await;
        self.scheduler.finish_smart_sync();
        result?;
        crate::logging::info_kv(
            "smart sync complete",
            &[
                ("pushed", &self.stats.files_pushed.to_string()),
                ("pulled", &self.stats.files_pulled.to_string()),
                ("dirty", &self.dirty.len().to_string()),
            ],
        );
        Ok(self.stats)
    }

    /// Drive the full scan to completion, yielding to the runtime between
    /// chunks. Returns early when a smart-sync request preempts the scan.
    pub async fn full_scan(&mut self) -> Result<ScanStep> {
        loop {
            match self.full_scan_step().await? {
                ScanStep::Continue => tokio::task::yield_now().await,
                done @ (ScanStep::Paused | ScanStep::Completed) => return Ok(done),
            }
        }
    }

    /// Process one chunk of the full scan, starting or resuming as needed.
    pub async fn full_scan_step(&mut self) -> Result<ScanStep> {
        let mut progress = match self.active_scan.take() {
            Some(p) => p,
            None => match self.scheduler.begin_full_scan()? {
                Some(resumed) => resumed,
                None => self.build_scan_progress().await?,
            },
        };

        let end = (progress.cursor + SCAN_CHUNK_SIZE).min(progress.paths.len());
        for i in progress.cursor..end {
            let path = progress.paths[i].clone();
            let remote_state = progress
                .cached_remote
                .get(&path)
                .map(RemoteState::from_cloud);
            let mut ctx = self.ctx();
            if let Err(err) = pipeline::reconcile_one(&mut ctx, &path, remote_state.as_ref()).await
            {
                if sync_error_kind(&err).is_some_and(SyncError::is_fatal) {
                    self.scheduler.complete_full_scan();
                    return Err(err);
                }
                crate::logging::error(format!("full scan failed for {path}: {err:#}"));
            }
        }
        progress.cursor = end;

        if progress.cursor >= progress.paths.len() {
            // Scan settled the pull side; push whatever it dirtied.
            let mut ctx = self.ctx();
            pipeline::smart_push(&mut ctx, false).await?;
            self.scheduler.complete_full_scan();
            crate::logging::info("full scan complete");
            return Ok(ScanStep::Completed);
        }

        if self.scheduler.should_interrupt() {
            self.scheduler.pause_full_scan(progress);
            return Ok(ScanStep::Paused);
        }

        self.active_scan = Some(progress);
        Ok(ScanStep::Continue)
    }

    async fn build_scan_progress(&mut self) -> Result<FullScanProgress> {
        let local = self.vfs.list().await.context("list vault")?;
        let remote_files = self.remote.adapter.list_files().await.context("list remote")?;

        let mut cached_local = HashMap::new();
        for (path, stat) in local {
            if self.filters.should_ignore(&path, false) || path == INDEX_PATH {
                continue;
            }
            cached_local.insert(path, stat);
        }

        let mut cached_remote = HashMap::new();
        for file in remote_files {
            if self.filters.should_ignore(&file.path, false) || file.path == INDEX_PATH {
                continue;
            }
            cached_remote.insert(file.path.clone(), file);
        }

        let mut paths: Vec<String> = cached_local
            .keys()
            .chain(cached_remote.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let extra_paths: Vec<String> = self
            .index
            .paths()
            .into_iter()
            .filter(|p| p != INDEX_PATH && !paths.contains(p))
            .collect();
        paths.extend(extra_paths);
        paths.sort();

        crate::logging::info_kv(
            "full scan starting",
            &[("files", &paths.len().to_string())],
        );
        Ok(FullScanProgress {
            cursor: 0,
            paths,
            cached_local,
            cached_remote,
            started_at: Instant::now(),
        })
    }

    /// Daemon loop: startup sync, then events, periodic syncs, and
    /// cooperative full-scan resumption until shutdown.
    pub async fn run(&mut self, mut events: EventReceiver, shutdown: Arc<Notify>) -> Result<()> {
        if let Err(err) = self.smart_sync(true).await {
            if sync_error_kind(&err).is_some_and(SyncError::is_fatal) {
                return Err(err);
            }
            crate::logging::error(format!("startup sync failed: {err:#}"));
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.sync_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            let scanning = self.scheduler.state() == SchedulerState::FullScanning
                || self.active_scan.is_some();

            tokio::select! {
                biased;

                _ = shutdown.notified() => break,

                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.apply_event(&event),
                        None => break, // watcher gone
                    }
                }

                _ = ticker.tick() => {
                    self.scheduler.request_smart_sync();
                    if let Err(err) = self.smart_sync(false).await {
                        if sync_error_kind(&err).is_some_and(SyncError::is_fatal) {
                            return Err(err);
                        }
                        crate::logging::error(format!("periodic sync failed: {err:#}"));
                    }
                }

                _ = tokio::task::yield_now(), if scanning => {
                    if let Err(err) = self.full_scan_step().await {
                        crate::logging::error(format!("full scan step failed: {err:#}"));
                    }
                }
            }
        }

        self.index.save().context("save index at shutdown")?;
        Ok(())
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }
}
