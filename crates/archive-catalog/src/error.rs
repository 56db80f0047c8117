//! Error taxonomy of the catalog engine.
//!
//! Backend failures arrive as `SourceError` and are classified here before
//! they leave the repository or cache boundary.

use std::path::PathBuf;

use archive_catalog_core::SourceError;

/// Failure of a repository load.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Backend connection error: {0}")]
    Connection(String),

    #[error("Malformed row: {0}")]
    MalformedRow(String),

    #[error("Node {node_id} references missing parent {parent_id}")]
    DanglingParent { node_id: String, parent_id: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("{count} node(s) are not reachable from the catalog root")]
    Unreachable { count: usize },
}

impl RepositoryError {
    /// Whether the load failed because the catalog itself is inconsistent
    /// rather than because the backend could not be read.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::DanglingParent { .. } | Self::DuplicateNode(_) | Self::Unreachable { .. }
        )
    }
}

impl From<SourceError> for RepositoryError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Connection(msg) => Self::Connection(msg),
            SourceError::MalformedRow(msg) => Self::MalformedRow(msg),
        }
    }
}

/// Failure of an asset round trip as a whole.
///
/// Per-id failures never surface; they resolve to the fallback asset.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset fetch failed: {0}")]
    Connection(String),
}

impl From<SourceError> for AssetError {
    fn from(err: SourceError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Failure of the per-user session guard.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Profile {} is in use by another session{}", .path.display(), holder_suffix(.holder_pid))]
    AlreadyRunning {
        path: PathBuf,
        holder_pid: Option<u32>,
    },

    #[error("Session guard was already released")]
    Released,

    #[error("Profile I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GuardError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn holder_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {})", pid),
        None => String::new(),
    }
}

/// Failure while opening or driving a catalog session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Asset(#[from] AssetError),
}
