use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rgdl::{Config, Status};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON config file (every key optional)
    #[arg(short = 'C', long = "config")]
    pub config: Option<PathBuf>,

    /// Directory for maps, POIs, boundaries, elevation tiles and the state file
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Catalog document to use instead of the bundled one
    #[arg(long = "catalog")]
    pub catalog: Option<PathBuf>,

    /// Maximum number of regions downloading at once
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the continents in the catalog
    Continents,

    /// List the regions of a continent with their download status
    Regions {
        continent: String,

        #[arg(long, value_enum, default_value = "all")]
        show: StatusFilter,
    },

    /// Download or resume regions, e.g. `europe/germany/bayern` (Ctrl-C pauses)
    Download {
        #[arg(required = true)]
        regions: Vec<String>,
    },

    /// Show persisted progress for all regions or one region
    Status { region: Option<String> },

    /// Delete the map, POI and boundary files of regions (elevation tiles are kept)
    Delete {
        #[arg(required = true)]
        regions: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum StatusFilter {
    All,
    /// Anything started at least once
    Started,
    Completed,
}

impl StatusFilter {
    pub fn matches(self, status: Status) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Started => status != Status::NotDownloaded,
            StatusFilter::Completed => status == Status::Completed,
        }
    }
}

impl Args {
    /// Applies command-line overrides on top of the file configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(catalog) = &self.catalog {
            config.catalog_path = Some(catalog.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.rate_limit.is_some() {
            config.rate_limit = self.rate_limit;
        }
    }
}
