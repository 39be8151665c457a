use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::state::FileRole;
use crate::tiles::TileRef;

pub const STATE_FILE_NAME: &str = "download_state.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Catalog document to use instead of the bundled one.
    pub catalog_path: Option<PathBuf>,
    pub map_base_url: String,
    pub poi_base_url: String,
    pub boundary_base_url: String,
    pub elevation_base_url: String,
    pub concurrency: usize,
    /// Global limit in bytes per second across all transfers.
    pub rate_limit: Option<u32>,
    /// Bytes transferred between two throttled state saves.
    pub save_threshold_bytes: u64,
    pub connect_timeout_secs: u64,
    /// Maximum silence on a connection before the transfer fails.
    pub read_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("regions"),
            catalog_path: None,
            map_base_url: "https://download.mapsforge.org/maps/v5".into(),
            poi_base_url: "https://download.mapsforge.org/pois".into(),
            boundary_base_url: "https://download.geofabrik.de".into(),
            elevation_base_url: "https://elevation-tiles-prod.s3.amazonaws.com/skadi".into(),
            concurrency: num_cpus::get().clamp(1, 4),
            rate_limit: None,
            save_threshold_bytes: 4 * 1024 * 1024,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            user_agent: format!("rgdl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for base in [
            &self.map_base_url,
            &self.poi_base_url,
            &self.boundary_base_url,
            &self.elevation_base_url,
        ] {
            let url = Url::parse(base).with_context(|| format!("Invalid base URL {:?}", base))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("Unsupported scheme in base URL {:?}", base);
            }
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.rate_limit == Some(0) {
            bail!("rate limit must be greater than 0");
        }
        Ok(())
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }

    pub fn tile_root(&self) -> PathBuf {
        self.data_dir.join("elevation")
    }

    /// Local file for one role of a region, e.g. `maps/europe/germany/bayern.map`.
    pub fn local_file(&self, role: FileRole, region_path: &str) -> PathBuf {
        self.data_dir
            .join(role.dir_name())
            .join(format!("{}.{}", region_path, role.extension()))
    }

    /// Remote URL for one role of a region, keyed by `{continent}/{sub_path}`.
    pub fn remote_url(&self, role: FileRole, continent: &str, sub_path: &str) -> String {
        let base = match role {
            FileRole::Map => &self.map_base_url,
            FileRole::Poi => &self.poi_base_url,
            FileRole::Boundary => &self.boundary_base_url,
        };
        format!(
            "{}/{}/{}.{}",
            base.trim_end_matches('/'),
            continent,
            sub_path,
            role.extension()
        )
    }

    pub fn tile_url(&self, tile: &TileRef) -> String {
        format!(
            "{}/{}",
            self.elevation_base_url.trim_end_matches('/'),
            tile.remote_path()
        )
    }
}
