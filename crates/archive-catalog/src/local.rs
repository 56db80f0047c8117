use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use archive_catalog_core::{AssetId, AssetMap, CatalogSource, DocumentRow, NodeRow, SourceError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// On-disk catalog dump: the node list, the document table and the asset
/// blobs (base64, `null` for a null blob).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogDump {
    #[serde(default)]
    pub nodes: Vec<NodeRow>,
    #[serde(default)]
    pub documents: Vec<DocumentRow>,
    #[serde(default)]
    pub assets: HashMap<AssetId, Option<String>>,
}

/// Catalog source reading a JSON dump from the local filesystem.
///
/// The file is re-read on every call, so each call behaves like one
/// backend round trip and sees edits made between calls.
pub struct JsonCatalogSource {
    path: PathBuf,
}

impl JsonCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_dump(&self) -> Result<CatalogDump, SourceError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            SourceError::Connection(format!(
                "Failed to read catalog {}: {}",
                self.path.display(),
                e
            ))
        })?;

        serde_json::from_slice(&data).map_err(|e| {
            SourceError::MalformedRow(format!(
                "Failed to parse catalog {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl CatalogSource for JsonCatalogSource {
    async fn list_nodes(&self) -> Result<Vec<NodeRow>, SourceError> {
        let nodes = self.read_dump().await?.nodes;
        debug!("Listed {} nodes from {}", nodes.len(), self.path.display());
        Ok(nodes)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRow>, SourceError> {
        let documents = self.read_dump().await?.documents;
        debug!(
            "Listed {} documents from {}",
            documents.len(),
            self.path.display()
        );
        Ok(documents)
    }

    async fn fetch_assets(&self, ids: &BTreeSet<AssetId>) -> Result<AssetMap, SourceError> {
        let mut dump = self.read_dump().await?;

        let mut assets = AssetMap::with_capacity(ids.len());
        for id in ids {
            let Some(encoded) = dump.assets.remove(id) else {
                continue;
            };
            let blob = match encoded {
                Some(encoded) => match BASE64.decode(encoded.trim()) {
                    Ok(raw) => Some(Bytes::from(raw)),
                    Err(e) => {
                        warn!("Asset {} has an undecodable blob: {}", id, e);
                        None
                    }
                },
                None => None,
            };
            assets.insert(*id, blob);
        }

        Ok(assets)
    }
}
