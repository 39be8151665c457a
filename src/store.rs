use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::state::{RegionDownloadState, Status};

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct StateDocument {
    regions: BTreeMap<String, RegionDownloadState>,
}

/// Reads the state document. A missing file is an empty map.
pub async fn load_states(path: &Path) -> Result<BTreeMap<String, RegionDownloadState>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read state file {:?}", path)),
    };

    let doc: StateDocument = serde_json::from_str(&content)
        .with_context(|| format!("Malformed state file {:?}", path))?;

    let mut regions = doc.regions;
    for (region, state) in regions.iter_mut() {
        if state.status == Status::InProgress {
            debug!("{} was interrupted, marking paused", region);
            state.status = Status::Paused;
        }
    }
    Ok(regions)
}

pub async fn save_states(path: &Path, states: &BTreeMap<String, RegionDownloadState>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory {:?}", parent))?;
        }
    }

    let doc = StateDocument {
        regions: states.clone(),
    };
    let content = serde_json::to_vec_pretty(&doc)?;
    let tmp_path = temp_path(path);

    let mut file = fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("Failed to create {:?}", tmp_path))?;
    file.write_all(&content)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp_path))?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to replace state file {:?}", path))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    states: DashMap<String, RegionDownloadState>,
    write_lock: Mutex<()>,
    unsaved_bytes: AtomicU64,
    save_threshold: u64,
}

impl StateStore {
    pub async fn open(path: PathBuf, save_threshold: u64) -> Self {
        let states = match load_states(&path).await {
            Ok(states) => {
                if !states.is_empty() {
                    info!("Loaded state for {} regions from {:?}", states.len(), path);
                }
                states
            }
            Err(e) => {
                error!("{:#}, starting with empty state", e);
                BTreeMap::new()
            }
        };
        Self::with_states(path, save_threshold, states)
    }

    pub fn with_states(
        path: PathBuf,
        save_threshold: u64,
        states: BTreeMap<String, RegionDownloadState>,
    ) -> Self {
        Self {
            path,
            states: states.into_iter().collect(),
            write_lock: Mutex::new(()),
            unsaved_bytes: AtomicU64::new(0),
            save_threshold,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure(&self, region: &str) {
        self.states.entry(region.to_string()).or_default();
    }

    pub fn get(&self, region: &str) -> RegionDownloadState {
        self.states
            .get(region)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn update<F>(&self, region: &str, f: F) -> RegionDownloadState
    where
        F: FnOnce(&mut RegionDownloadState),
    {
        let mut entry = self.states.entry(region.to_string()).or_default();
        f(entry.value_mut());
        entry.touch();
        entry.value().clone()
    }

    pub fn remove(&self, region: &str) -> Option<RegionDownloadState> {
        self.states.remove(region).map(|(_, state)| state)
    }

    pub fn snapshot(&self) -> BTreeMap<String, RegionDownloadState> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn record_transferred(&self, bytes: u64) -> bool {
        let total = self.unsaved_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if total >= self.save_threshold {
            self.unsaved_bytes.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Persists every entry that has been touched.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let states: BTreeMap<_, _> = self
            .snapshot()
            .into_iter()
            .filter(|(_, s)| *s != RegionDownloadState::default())
            .collect();
        self.unsaved_bytes.store(0, Ordering::Relaxed);
        save_states(&self.path, &states).await
    }
}
