use std::path::{Path, PathBuf};

use crate::boundary::BoundingBox;

pub const TILE_SUFFIX: &str = ".hgt.gz";

/// One elevation tile, stored as `{band}/{filename}` both remotely and locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileRef {
    /// Latitude component of the name, e.g. `N47`.
    pub band: String,
    /// Tile name plus suffix, e.g. `N47E009.hgt.gz`.
    pub filename: String,
}

impl TileRef {
    pub fn at(lat: i32, lon: i32) -> Self {
        let band = format!("{}{:02}", if lat < 0 { 'S' } else { 'N' }, lat.unsigned_abs());
        let filename = format!(
            "{}{}{:03}{}",
            band,
            if lon < 0 { 'W' } else { 'E' },
            lon.unsigned_abs(),
            TILE_SUFFIX
        );
        Self { band, filename }
    }

    pub fn name(&self) -> &str {
        self.filename.strip_suffix(TILE_SUFFIX).unwrap_or(&self.filename)
    }

    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.band, self.filename)
    }

    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(&self.band).join(&self.filename)
    }
}

/// Every whole-degree cell the box touches, both ends inclusive, latitude-major.
/// Cells outside the globe are never produced.
pub fn tiles_for(bbox: &BoundingBox) -> Vec<TileRef> {
    let lat_range = cell(bbox.min_lat, 90)..=cell(bbox.max_lat, 90);
    let lon_range = cell(bbox.min_lon, 180)..=cell(bbox.max_lon, 180);

    lat_range
        .flat_map(|lat| lon_range.clone().map(move |lon| TileRef::at(lat, lon)))
        .collect()
}

// South-west corner of the cell holding `deg`; a box edge on +90/+180 belongs
// to the last cell.
fn cell(deg: f64, limit: i32) -> i32 {
    if deg.is_nan() {
        return 0;
    }
    (deg.floor().clamp(-(limit as f64), limit as f64) as i32).min(limit - 1)
}
