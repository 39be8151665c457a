use std::io;
use std::path::Path;

use log::{debug, warn};

const TERMINATOR: &str = "END";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    fn point(lat: f64, lon: f64) -> Self {
        Self {
            min_lat: lat,
            max_lat: lat,
            min_lon: lon,
            max_lon: lon,
        }
    }

    fn extend(&mut self, lat: f64, lon: f64) {
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
        self.min_lon = self.min_lon.min(lon);
        self.max_lon = self.max_lon.max(lon);
    }
}

/// Folds every coordinate pair of a boundary document into a box.
/// Returns `None` when the text holds no coordinates at all.
pub fn parse_bounding_box(content: &str) -> Option<BoundingBox> {
    let mut bbox: Option<BoundingBox> = None;

    for line in content.lines() {
        let Some((lon, lat)) = parse_coordinate_line(line) else {
            continue;
        };
        match bbox.as_mut() {
            Some(b) => b.extend(lat, lon),
            None => bbox = Some(BoundingBox::point(lat, lon)),
        }
    }

    bbox
}

/// Unreadable files count as malformed: no box, no tiles.
pub async fn extract_bounding_box(path: &Path) -> Option<BoundingBox> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No boundary file at {:?}", path);
            return None;
        }
        Err(e) => {
            warn!("Cannot read boundary file {:?}: {}", path, e);
            return None;
        }
    };
    let bbox = parse_bounding_box(&content);
    if bbox.is_none() && !content.trim().is_empty() {
        warn!("Boundary file {:?} holds no usable coordinates", path);
    }
    bbox
}

fn parse_coordinate_line(line: &str) -> Option<(f64, f64)> {
    let line = line.trim();
    let first = line.chars().next()?;
    if line == TERMINATOR || first.is_alphabetic() || first == '!' {
        return None;
    }

    let mut tokens = line.split_whitespace();
    let lon = tokens.next()?.parse::<f64>().ok()?;
    let lat = tokens.next()?.parse::<f64>().ok()?;
    if tokens.next().is_some() {
        return None;
    }
    // Also rejects NaN and infinities.
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return None;
    }
    Some((lon, lat))
}
