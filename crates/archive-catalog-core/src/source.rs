use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::rows::{AssetId, AssetMap, DocumentRow, NodeRow};

/// Remote backend holding the catalog, its document table and the icon blobs.
///
/// Every call is one round trip. Implementations classify their failures
/// into `SourceError` before returning.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// List every catalog node visible to the session user.
    async fn list_nodes(&self) -> Result<Vec<NodeRow>, SourceError>;

    /// List the complete document table.
    async fn list_documents(&self) -> Result<Vec<DocumentRow>, SourceError>;

    /// Fetch the blobs for a set of asset ids in one round trip.
    ///
    /// # Returns
    /// A map holding an entry for every id the backend knows
    /// (`None` for a null blob). Unknown ids are left out.
    async fn fetch_assets(&self, ids: &BTreeSet<AssetId>) -> Result<AssetMap, SourceError>;
}
