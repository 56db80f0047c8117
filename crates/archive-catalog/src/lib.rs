//! Lazy-loading archive catalog engine.
//!
//! - `NodeRepository`: flat backend rows linked into an ordered tree, with
//!   folder documents merged on first expansion
//! - `AssetCache`: batched, deduplicated icon lookups with a shared fallback
//! - `SessionGuard`: one live session per user profile, via an OS file lock
//! - `CatalogSession`: the lifecycle tying the three together

pub mod assets;
pub mod config;
pub mod error;
pub mod guard;
pub mod local;
pub mod repository;
pub mod session;

pub use archive_catalog_core::{
    AssetId, AssetMap, CatalogSource, DocumentRow, NodeRow, SourceError, ROOT_PARENT_ID,
};
pub use assets::{AssetCache, AssetCacheConfig, PLACEHOLDER_ICON};
pub use error::{AssetError, GuardError, RepositoryError, SessionError};
pub use guard::{ConfigSeed, ProfileLayout, SessionGuard};
pub use local::JsonCatalogSource;
pub use repository::{CatalogNode, NodeKind, NodeRepository, ROOT_ID};
pub use session::{CatalogSession, IconBatch};
