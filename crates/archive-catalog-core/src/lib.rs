//! Core traits and types for the archive catalog engine.
//!
//! This crate defines the backend-neutral boundary of the catalog:
//! - `CatalogSource`: the remote backend that lists nodes, documents and asset blobs
//! - `NodeRow` / `DocumentRow`: the raw row shapes the backend returns
//! - `SourceError`: the classified failure every backend binding reports

mod error;
mod rows;
mod source;

pub use error::SourceError;
pub use rows::{AssetId, AssetMap, DocumentRow, NodeRow, ROOT_PARENT_ID};
pub use source::CatalogSource;
