use std::io;
use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Hard failure of a single file transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("{url} ended after {received} of {expected} bytes")]
    Incomplete {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("{url} sent a range starting at byte {received}, expected {expected}")]
    RangeMismatch {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("no data from {url} for {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// True for faults caused by the network or the remote server.
    ///
    /// The orchestrator maps these to `ERROR`, everything else to `PARTIAL`.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            TransferError::Request { .. }
                | TransferError::Status { .. }
                | TransferError::Incomplete { .. }
                | TransferError::RangeMismatch { .. }
                | TransferError::Timeout { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed catalog document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid slug {slug:?} under {parent}")]
    InvalidSlug { parent: String, slug: String },
}
