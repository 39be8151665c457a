//! Region download orchestration.
//!
//! A region run fetches, in order: boundary polygon, map, POI file, then every
//! elevation tile the boundary's bounding box touches. Each run is one tokio
//! task; the number of runs doing I/O at once is bounded by a semaphore.
//!
//! ```text
//! start ──► IN_PROGRESS ──► COMPLETED
//!                │  ├─────► PAUSED   (cancel)
//!                │  ├─────► ERROR    (network fault)
//!                │  └─────► PARTIAL  (any other fault)
//! PAUSED / ERROR / PARTIAL ──start──► IN_PROGRESS
//! any ──delete──► NOT_DOWNLOADED
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::boundary::extract_bounding_box;
use crate::catalog::{Catalog, RegionEntry};
use crate::config::Config;
use crate::error::TransferError;
use crate::locks::KeyedLocks;
use crate::state::{FileProgress, FileRole, RegionDownloadState, Status};
use crate::store::StateStore;
use crate::tiles::{tiles_for, TileRef};
use crate::transfer::{FileTransfer, SkipReason, TransferOutcome};
use crate::utils::{file_len, is_valid_slug, remove_file_if_exists};

/// Receives region events. Called from download tasks, so implementations
/// must be cheap and thread-safe.
pub trait RegionListener: Send + Sync {
    /// Any byte or tile count changed.
    fn on_progress(&self, region: &RegionEntry, state: &RegionDownloadState);
    /// Exactly once per successful run.
    fn on_complete(&self, region: &RegionEntry, state: &RegionDownloadState);
    /// At most once per failed run; the region is left resumable.
    fn on_error(&self, region: &RegionEntry, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl RegionListener for NoopListener {
    fn on_progress(&self, _: &RegionEntry, _: &RegionDownloadState) {}
    fn on_complete(&self, _: &RegionEntry, _: &RegionDownloadState) {}
    fn on_error(&self, _: &RegionEntry, _: &str) {}
}

enum RunEnd {
    Finished,
    Cancelled,
}

struct RegionTask {
    run_id: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    config: Config,
    catalog: Catalog,
    store: Arc<StateStore>,
    transfer: FileTransfer,
    workers: Arc<Semaphore>,
    tasks: DashMap<String, RegionTask>,
    /// Held for the whole run so a restarted region waits for its cancelled
    /// predecessor to stop writing.
    region_locks: KeyedLocks,
    /// In-flight registry for tiles shared between regions.
    tile_locks: KeyedLocks,
    next_run: AtomicU64,
}

#[derive(Clone)]
pub struct RegionDownloader {
    inner: Arc<Inner>,
}

impl RegionDownloader {
    pub async fn new(config: Config) -> Self {
        let catalog = Catalog::load(config.catalog_path.as_deref());
        let store = StateStore::open(config.state_file(), config.save_threshold_bytes).await;
        Self::with_parts(config, catalog, store)
    }

    pub fn with_parts(config: Config, catalog: Catalog, store: StateStore) -> Self {
        for entry in catalog.entries() {
            store.ensure(&entry.path);
        }
        let transfer = FileTransfer::new(&config);
        let workers = Arc::new(Semaphore::new(config.concurrency.max(1)));

        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                store: Arc::new(store),
                transfer,
                workers,
                tasks: DashMap::new(),
                region_locks: KeyedLocks::new(),
                tile_locks: KeyedLocks::new(),
                next_run: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn region(&self, path: &str) -> RegionEntry {
        self.inner
            .catalog
            .find(path)
            .unwrap_or_else(|| RegionEntry::from_path(path))
    }

    pub fn state(&self, path: &str) -> RegionDownloadState {
        self.inner.store.get(path)
    }

    pub fn states(&self) -> BTreeMap<String, RegionDownloadState> {
        self.inner.store.snapshot()
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.inner
            .tasks
            .get(path)
            .map(|task| !task.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Starts or resumes a region. Returns `false` if it is already running.
    pub async fn start(
        &self,
        region: &RegionEntry,
        listener: Arc<dyn RegionListener>,
    ) -> Result<bool> {
        check_region_path(&region.path)?;
        let path = region.path.clone();

        let cancel = CancellationToken::new();
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let task = RegionTask {
            run_id,
            cancel: cancel.clone(),
            handle: None,
        };
        match self.inner.tasks.entry(path.clone()) {
            Entry::Occupied(entry) if !entry.get().cancel.is_cancelled() => {
                debug!("{} is already downloading", path);
                return Ok(false);
            }
            Entry::Occupied(mut entry) => {
                entry.insert(task);
            }
            Entry::Vacant(entry) => {
                entry.insert(task);
            }
        }

        self.inner.store.update(&path, |s| {
            s.status = Status::InProgress;
            s.last_error = None;
        });
        self.persist().await;
        info!("Starting {}", path);

        let this = self.clone();
        let region = region.clone();
        let handle = tokio::spawn(async move {
            this.run(region, listener, cancel, run_id).await;
        });

        if let Some(mut task) = self.inner.tasks.get_mut(&path) {
            if task.run_id == run_id {
                task.handle = Some(handle);
            }
        }
        Ok(true)
    }

    pub async fn cancel(&self, path: &str) {
        if let Some((_, task)) = self.inner.tasks.remove(path) {
            task.cancel.cancel();
            info!("Pausing {}", path);
        }

        if self.inner.store.get(path).status == Status::InProgress {
            self.inner.store.update(path, |s| {
                if s.status == Status::InProgress {
                    s.status = Status::Paused;
                }
            });
            self.persist().await;
        }
    }

    pub async fn cancel_all(&self) {
        let paths: Vec<String> = self.inner.tasks.iter().map(|t| t.key().clone()).collect();
        for path in paths {
            self.cancel(&path).await;
        }
    }

    /// Cancels the region, removes its map, POI and boundary files and forgets
    /// its state. Elevation tiles are shared and stay on disk.
    pub async fn delete(&self, path: &str) -> Result<()> {
        check_region_path(path)?;
        self.cancel(path).await;
        let _guard = self.inner.region_locks.lock(path).await;

        for role in FileRole::ALL {
            let file = self.inner.config.local_file(role, path);
            if remove_file_if_exists(&file)
                .await
                .with_context(|| format!("Failed to remove {:?}", file))?
            {
                debug!("Removed {:?}", file);
            }
        }

        self.inner.store.remove(path);
        if self.inner.catalog.find(path).is_some() {
            self.inner.store.ensure(path);
        }
        self.inner.store.save().await?;
        info!("Deleted {}", path);
        Ok(())
    }

    /// Waits for the run of `path` to finish, including a cancelled run whose
    /// handle was already detached.
    pub async fn join(&self, path: &str) {
        let handle = self
            .inner
            .tasks
            .get_mut(path)
            .and_then(|mut task| task.handle.take());
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Download task for {} failed: {}", path, e);
                }
            }
            None => {
                // A detached run holds the region lock until it has flushed.
                drop(self.inner.region_locks.lock(path).await);
                self.inner.region_locks.prune();
            }
        }
    }

    async fn run(
        &self,
        region: RegionEntry,
        listener: Arc<dyn RegionListener>,
        cancel: CancellationToken,
        run_id: u64,
    ) {
        let path = region.path.clone();
        let region_guard = self.inner.region_locks.lock(&path).await;
        // A queued run must give up its region lock as soon as it is cancelled,
        // not when some other region frees a worker.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.inner.workers.clone().acquire_owned() => permit.ok(),
        };

        let result = match permit {
            Some(_permit) => self.download_region(&region, listener.as_ref(), &cancel).await,
            None => Ok(RunEnd::Cancelled),
        };

        match result {
            Ok(RunEnd::Finished) if !cancel.is_cancelled() => {
                let state = self.inner.store.update(&path, |s| {
                    if s.status == Status::InProgress {
                        s.status = Status::Completed;
                    }
                });
                self.persist().await;
                if state.status == Status::Completed {
                    info!("Completed {}", path);
                    listener.on_complete(&region, &state);
                }
            }
            Ok(_) => {
                debug!("{} stopped after cancel", path);
                self.persist().await;
            }
            Err(e) if cancel.is_cancelled() => {
                debug!("{} failed after cancel: {}", path, e);
                self.persist().await;
            }
            Err(e) => {
                let status = if e.is_network() {
                    Status::Error
                } else {
                    Status::Partial
                };
                let message = e.to_string();
                warn!("{} stopped: {}", path, message);
                self.inner.store.update(&path, |s| {
                    if s.status == Status::InProgress {
                        s.status = status;
                    }
                    s.last_error = Some(message.clone());
                });
                self.persist().await;
                listener.on_error(&region, &message);
            }
        }

        self.inner
            .tasks
            .remove_if(&path, |_, task| task.run_id == run_id);
        drop(region_guard);
        self.inner.region_locks.prune();
    }

    async fn download_region(
        &self,
        region: &RegionEntry,
        listener: &dyn RegionListener,
        cancel: &CancellationToken,
    ) -> Result<RunEnd, TransferError> {
        // Boundary first: the tile set is derived from it.
        for role in [FileRole::Boundary, FileRole::Map, FileRole::Poi] {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }
            let outcome = self.fetch_file(region, role, listener, cancel).await?;
            if matches!(outcome, TransferOutcome::Cancelled(_)) {
                return Ok(RunEnd::Cancelled);
            }
        }

        if cancel.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }
        self.fetch_tiles(region, listener, cancel).await
    }

    async fn fetch_file(
        &self,
        region: &RegionEntry,
        role: FileRole,
        listener: &dyn RegionListener,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let config = &self.inner.config;
        let store = &self.inner.store;
        let dest = config.local_file(role, &region.path);

        let current = store.get(&region.path).progress(role);
        if current.is_complete() && file_len(&dest).await == current.total {
            debug!("{} {} already on disk", region.path, role);
            return Ok(TransferOutcome::Skipped(SkipReason::AlreadyComplete(current)));
        }

        let url = config.remote_url(role, &region.continent, region.sub_path());
        debug!("Fetching {} {} from {}", region.path, role, url);
        self.persist().await;

        let mut last_seen: Option<u64> = None;
        let result = self
            .inner
            .transfer
            .transfer(&url, &dest, cancel, |progress| {
                let state = store.update(&region.path, |s| *s.progress_mut(role) = progress);
                listener.on_progress(region, &state);
                self.count_bytes(&mut last_seen, progress);
            })
            .await;

        self.persist().await;
        if let Ok(TransferOutcome::Skipped(SkipReason::NotFound)) = result {
            info!("{} has no {} file upstream", region.path, role);
        }
        result
    }

    async fn fetch_tiles(
        &self,
        region: &RegionEntry,
        listener: &dyn RegionListener,
        cancel: &CancellationToken,
    ) -> Result<RunEnd, TransferError> {
        let boundary = self.inner.config.local_file(FileRole::Boundary, &region.path);
        let Some(bbox) = extract_bounding_box(&boundary).await else {
            debug!("{} has no usable boundary, skipping elevation tiles", region.path);
            return Ok(RunEnd::Finished);
        };

        let tiles = tiles_for(&bbox);
        let store = &self.inner.store;
        let state = store.update(&region.path, |s| {
            s.tiles_total = tiles.len() as u32;
            s.tiles_downloaded = 0;
        });
        listener.on_progress(region, &state);
        debug!("{} needs {} elevation tiles", region.path, tiles.len());

        let root = self.inner.config.tile_root();
        for tile in &tiles {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }

            let dest = tile.local_path(&root);
            if !exists(&dest).await {
                let _guard = self.inner.tile_locks.lock(&tile.remote_path()).await;
                // Another region may have fetched it while we waited.
                if !exists(&dest).await {
                    let outcome = self.fetch_tile(tile, &dest, cancel).await?;
                    if matches!(outcome, TransferOutcome::Cancelled(_)) {
                        return Ok(RunEnd::Cancelled);
                    }
                }
            }

            let state = store.update(&region.path, |s| {
                s.tiles_downloaded = (s.tiles_downloaded + 1).min(s.tiles_total);
            });
            listener.on_progress(region, &state);
        }

        self.inner.tile_locks.prune();
        Ok(RunEnd::Finished)
    }

    /// Downloads into `<tile>.part` and renames, so a tile file on disk is
    /// always complete.
    async fn fetch_tile(
        &self,
        tile: &TileRef,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let url = self.inner.config.tile_url(tile);
        let mut part_name = tile.filename.clone();
        part_name.push_str(".part");
        let part = dest.with_file_name(part_name);

        self.persist().await;
        let mut last_seen: Option<u64> = None;
        let outcome = self
            .inner
            .transfer
            .transfer(&url, &part, cancel, |progress| {
                self.count_bytes(&mut last_seen, progress);
            })
            .await;
        self.persist().await;

        let outcome = outcome?;
        if let TransferOutcome::Cancelled(_) = outcome {
            return Ok(outcome);
        }
        match outcome.progress() {
            Some(progress) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .map_err(|e| TransferError::io(dest, e))?;
                debug!("Stored elevation tile {} ({} bytes)", tile.name(), progress.downloaded);
            }
            None => debug!("No elevation tile {} upstream", tile.name()),
        }
        Ok(outcome)
    }

    fn count_bytes(&self, last_seen: &mut Option<u64>, progress: FileProgress) {
        let delta = match *last_seen {
            Some(prev) => progress.downloaded.saturating_sub(prev),
            None => 0,
        };
        *last_seen = Some(progress.downloaded);
        if self.inner.store.record_transferred(delta) {
            let store = Arc::clone(&self.inner.store);
            tokio::spawn(async move {
                if let Err(e) = store.save().await {
                    warn!("Failed to save download state: {:#}", e);
                }
            });
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.inner.store.save().await {
            warn!("Failed to save download state: {:#}", e);
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Region paths become file paths and URLs, so every segment must be a slug.
fn check_region_path(path: &str) -> Result<()> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 2 || !segments.iter().all(|s| is_valid_slug(s)) {
        bail!("Invalid region path {:?}", path);
    }
    Ok(())
}
