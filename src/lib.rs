//! Offline region downloads.
//!
//! A region (a country or a sub-region of one) consists of a map file, a POI
//! file, a boundary polygon and the elevation tiles covering the polygon's
//! bounding box. [`RegionDownloader`] fetches all of them with resumable
//! HTTP transfers, persists progress across restarts and reports events to a
//! [`RegionListener`].

pub mod boundary;
pub mod catalog;
pub mod config;
pub mod error;
pub mod locks;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod tiles;
pub mod transfer;
pub mod utils;

pub use catalog::{Catalog, RegionEntry};
pub use config::Config;
pub use error::{CatalogError, TransferError};
pub use orchestrator::{NoopListener, RegionDownloader, RegionListener};
pub use state::{FileProgress, FileRole, RegionDownloadState, Status};
pub use store::StateStore;
pub use transfer::{FileTransfer, SkipReason, TransferOutcome};
