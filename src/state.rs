use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    NotDownloaded,
    InProgress,
    Completed,
    Paused,
    Partial,
    Error,
}

impl Status {
    pub fn is_resumable(self) -> bool {
        matches!(self, Status::Paused | Status::Partial | Status::Error)
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::NotDownloaded => "Not downloaded",
            Status::InProgress => "Downloading",
            Status::Completed => "Completed",
            Status::Paused => "Paused",
            Status::Partial => "Partial",
            Status::Error => "Error",
        }
    }
}

/// Byte progress of one transfer. `total` stays 0 until a response header
/// told us the size.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FileProgress {
    pub downloaded: u64,
    pub total: u64,
}

impl FileProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded, total }
    }

    pub fn fraction(&self) -> f64 {
        if self.total > 0 {
            self.downloaded as f64 / self.total as f64
        } else {
            0.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.downloaded >= self.total
    }
}

/// The three per-region files. Elevation tiles are shared and tracked by count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Map,
    Poi,
    Boundary,
}

impl FileRole {
    pub const ALL: [FileRole; 3] = [FileRole::Map, FileRole::Poi, FileRole::Boundary];

    pub fn extension(self) -> &'static str {
        match self {
            FileRole::Map => "map",
            FileRole::Poi => "poi",
            FileRole::Boundary => "poly",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            FileRole::Map => "maps",
            FileRole::Poi => "poi",
            FileRole::Boundary => "boundaries",
        }
    }
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileRole::Map => "map",
            FileRole::Poi => "poi",
            FileRole::Boundary => "boundary",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RegionDownloadState {
    pub status: Status,
    pub map: FileProgress,
    pub poi: FileProgress,
    pub boundary: FileProgress,
    pub tiles_downloaded: u32,
    pub tiles_total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RegionDownloadState {
    pub fn progress(&self, role: FileRole) -> FileProgress {
        match role {
            FileRole::Map => self.map,
            FileRole::Poi => self.poi,
            FileRole::Boundary => self.boundary,
        }
    }

    pub fn progress_mut(&mut self, role: FileRole) -> &mut FileProgress {
        match role {
            FileRole::Map => &mut self.map,
            FileRole::Poi => &mut self.poi,
            FileRole::Boundary => &mut self.boundary,
        }
    }

    /// Byte-weighted progress over map, POI and boundary. Tiles are left out
    /// because only their count is known up front.
    pub fn overall_fraction(&self) -> f64 {
        let files = [self.map, self.poi, self.boundary];
        let total: u64 = files.iter().map(|p| p.total).sum();
        if total == 0 {
            return 0.0;
        }
        let downloaded: u64 = files.iter().map(|p| p.downloaded).sum();
        downloaded as f64 / total as f64
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.map.downloaded + self.poi.downloaded + self.boundary.downloaded
    }

    pub fn bytes_total(&self) -> u64 {
        self.map.total + self.poi.total + self.boundary.total
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}
