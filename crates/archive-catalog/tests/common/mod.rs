#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use archive_catalog::{AssetId, AssetMap, CatalogSource, DocumentRow, NodeRow, SourceError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x01];

/// A distinct valid PNG blob per id.
pub fn png(id: AssetId) -> Bytes {
    let mut blob = PNG.to_vec();
    blob.extend_from_slice(&id.to_be_bytes());
    Bytes::from(blob)
}

pub fn folder(id: &str, parent: &str, key: i32, name: &str, rank: i32) -> NodeRow {
    NodeRow {
        table: "classes".to_string(),
        owner_id: 1,
        key,
        name: name.to_string(),
        image_id: key,
        id: id.to_string(),
        parent_id: parent.to_string(),
        rank,
    }
}

pub fn document(owner: Option<i32>, doc_id: i32, name: &str) -> DocumentRow {
    DocumentRow {
        owner_class_id: owner,
        doc_id: Some(doc_id),
        designation: None,
        name: name.to_string(),
        image_id: 500 + doc_id,
        rank: None,
    }
}

/// In-memory catalog backend that records every call.
pub struct FakeSource {
    pub nodes: Mutex<Vec<NodeRow>>,
    pub documents: Mutex<Vec<DocumentRow>>,
    pub assets: Mutex<AssetMap>,
    pub fail_nodes: AtomicBool,
    pub fail_documents: AtomicBool,
    pub fail_assets: AtomicBool,
    pub node_calls: AtomicUsize,
    pub asset_requests: Mutex<Vec<BTreeSet<AssetId>>>,
    /// Asset fetches wait for a permit when gated
    gate: Option<Semaphore>,
    /// Only requests touching these ids are gated; all when unset
    gated_ids: Option<BTreeSet<AssetId>>,
}

impl FakeSource {
    pub fn new(nodes: Vec<NodeRow>, documents: Vec<DocumentRow>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
            documents: Mutex::new(documents),
            assets: Mutex::new(AssetMap::new()),
            fail_nodes: AtomicBool::new(false),
            fail_documents: AtomicBool::new(false),
            fail_assets: AtomicBool::new(false),
            node_calls: AtomicUsize::new(0),
            asset_requests: Mutex::new(Vec::new()),
            gate: None,
            gated_ids: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(vec![], vec![])
    }

    /// Asset fetches block until `open_gate` hands out permits.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Like `gated`, but requests not touching `ids` pass straight through.
    pub fn gated_for(mut self, ids: impl IntoIterator<Item = AssetId>) -> Self {
        self.gated_ids = Some(ids.into_iter().collect());
        self.gated()
    }

    pub fn open_gate(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn with_asset(self, id: AssetId, blob: Option<Bytes>) -> Self {
        self.assets.lock().unwrap().insert(id, blob);
        self
    }

    /// How many round trips requested `id`.
    pub fn fetch_count(&self, id: AssetId) -> usize {
        self.asset_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.contains(&id))
            .count()
    }

    pub fn round_trips(&self) -> usize {
        self.asset_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CatalogSource for FakeSource {
    async fn list_nodes(&self) -> Result<Vec<NodeRow>, SourceError> {
        self.node_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_nodes.load(Ordering::SeqCst) {
            return Err(SourceError::Connection("node list unavailable".to_string()));
        }
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRow>, SourceError> {
        if self.fail_documents.load(Ordering::SeqCst) {
            return Err(SourceError::Connection("document table unavailable".to_string()));
        }
        Ok(self.documents.lock().unwrap().clone())
    }

    async fn fetch_assets(&self, ids: &BTreeSet<AssetId>) -> Result<AssetMap, SourceError> {
        let held = self
            .gated_ids
            .as_ref()
            .is_none_or(|gated| !gated.is_disjoint(ids));
        if let Some(gate) = self.gate.as_ref().filter(|_| held) {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.asset_requests.lock().unwrap().push(ids.clone());
        if self.fail_assets.load(Ordering::SeqCst) {
            return Err(SourceError::Connection("blob table unavailable".to_string()));
        }
        let assets = self.assets.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| assets.get(id).map(|blob| (*id, blob.clone())))
            .collect())
    }
}
