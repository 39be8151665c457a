use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, error};
use serde::Deserialize;

use crate::error::CatalogError;
use crate::utils::{display_name_from_slug, is_valid_slug};

const BUNDLED_CATALOG: &str = include_str!("../assets/catalog.json");

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionEntry {
    pub continent: String,
    pub path: String,
    pub display_name: String,
    pub is_leaf: bool,
}

impl RegionEntry {
    fn new(continent: &str, path: String, slug: &str, is_leaf: bool) -> Self {
        Self {
            continent: continent.to_string(),
            path,
            display_name: display_name_from_slug(slug),
            is_leaf,
        }
    }

    /// Rebuilds an entry from a stored path when the catalog no longer lists it.
    pub fn from_path(path: &str) -> Self {
        let path = path.trim_matches('/');
        let continent = path.split('/').next().unwrap_or_default();
        let slug = path.rsplit('/').next().unwrap_or_default();
        Self::new(continent, path.to_string(), slug, true)
    }

    /// Path below the continent, e.g. `germany/bayern` for `europe/germany/bayern`.
    pub fn sub_path(&self) -> &str {
        self.path
            .strip_prefix(&self.continent)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(&self.path)
    }
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum ContinentDoc {
    Leaves(Vec<String>),
    Countries(BTreeMap<String, Option<Vec<String>>>),
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    continents: BTreeMap<String, Vec<RegionEntry>>,
}

impl Catalog {
    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let doc: BTreeMap<String, ContinentDoc> = serde_json::from_str(content)?;
        let mut continents = BTreeMap::new();

        for (continent, shape) in doc {
            check_slug("catalog", &continent)?;
            let mut entries = Vec::new();
            match shape {
                ContinentDoc::Leaves(slugs) => {
                    for slug in slugs {
                        check_slug(&continent, &slug)?;
                        let path = format!("{}/{}", continent, slug);
                        entries.push(RegionEntry::new(&continent, path, &slug, true));
                    }
                }
                ContinentDoc::Countries(countries) => {
                    for (country, subregions) in countries {
                        check_slug(&continent, &country)?;
                        let country_path = format!("{}/{}", continent, country);
                        let subregions = subregions.unwrap_or_default();
                        entries.push(RegionEntry::new(
                            &continent,
                            country_path.clone(),
                            &country,
                            subregions.is_empty(),
                        ));
                        for sub in subregions {
                            check_slug(&country_path, &sub)?;
                            let path = format!("{}/{}", country_path, sub);
                            entries.push(RegionEntry::new(&continent, path, &sub, true));
                        }
                    }
                }
            }
            entries.sort_by(|a, b| {
                a.display_name
                    .cmp(&b.display_name)
                    .then_with(|| a.path.cmp(&b.path))
            });
            continents.insert(continent, entries);
        }

        Ok(Self { continents })
    }

    pub fn bundled() -> Result<Self, CatalogError> {
        Self::from_json(BUNDLED_CATALOG)
    }

    pub fn read(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Loads the catalog at `path` (or the bundled one). A malformed catalog is
    /// a configuration error: it is logged once and no regions are offered.
    pub fn load(path: Option<&Path>) -> Self {
        let result = match path {
            Some(path) => Self::read(path),
            None => Self::bundled(),
        };
        match result {
            Ok(catalog) => {
                debug!(
                    "Loaded catalog with {} continents and {} regions",
                    catalog.continents.len(),
                    catalog.entries().count()
                );
                catalog
            }
            Err(e) => {
                error!("Catalog unusable, no regions available: {}", e);
                Self::default()
            }
        }
    }

    pub fn list_continents(&self) -> Vec<String> {
        self.continents.keys().cloned().collect()
    }

    pub fn list_regions(&self, continent: &str) -> Vec<RegionEntry> {
        self.continents.get(continent).cloned().unwrap_or_default()
    }

    pub fn find(&self, path: &str) -> Option<RegionEntry> {
        let path = path.trim_matches('/');
        let continent = path.split('/').next()?;
        self.continents
            .get(continent)?
            .iter()
            .find(|entry| entry.path == path)
            .cloned()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegionEntry> {
        self.continents.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.continents.is_empty()
    }
}

fn check_slug(parent: &str, slug: &str) -> Result<(), CatalogError> {
    if is_valid_slug(slug) {
        Ok(())
    } else {
        Err(CatalogError::InvalidSlug {
            parent: parent.to_string(),
            slug: slug.to_string(),
        })
    }
}
