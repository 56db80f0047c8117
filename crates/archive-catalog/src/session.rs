//! Catalog session: the lifecycle around the repository and the icon cache.
//!
//! Opening a session bootstraps and locks the user's profile, then loads the
//! catalog. Expanding a node returns its children at once and prefetches
//! their icons on a background task; the icons arrive later as an
//! `IconBatch`, unless the node was collapsed or re-expanded in between, in
//! which case the stale batch is dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use archive_catalog_core::{AssetId, CatalogSource};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::assets::{AssetCache, AssetCacheConfig};
use crate::error::{AssetError, SessionError};
use crate::guard::{ProfileLayout, SessionGuard};
use crate::repository::{CatalogNode, NodeRepository};

/// Icons prefetched for the children of one expanded node.
#[derive(Debug, Clone)]
pub struct IconBatch {
    pub node_id: String,
    pub request_id: Uuid,
    pub icons: HashMap<AssetId, Bytes>,
}

/// The live prefetch for a node. Only the holder of the current
/// `request_id` may deliver.
#[derive(Debug)]
struct PendingPrefetch {
    request_id: Uuid,
    abort: Option<AbortHandle>,
}

impl PendingPrefetch {
    fn cancel(self) {
        if let Some(abort) = self.abort {
            abort.abort();
        }
    }
}

/// One user's browsing session over the catalog.
pub struct CatalogSession {
    repository: Arc<NodeRepository>,
    assets: Arc<AssetCache>,
    /// node id -> in-flight icon prefetch
    pending: Arc<DashMap<String, PendingPrefetch>>,
    icon_tx: mpsc::UnboundedSender<IconBatch>,
    icon_rx: Option<mpsc::UnboundedReceiver<IconBatch>>,
    guard: SessionGuard,
}

impl std::fmt::Debug for CatalogSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogSession")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl CatalogSession {
    /// Bootstrap and lock the profile, then load the catalog.
    ///
    /// Fails with `GuardError::AlreadyRunning` when another session holds
    /// the profile; the catalog is not touched in that case. A failed load
    /// releases the profile again.
    #[instrument(skip(source, asset_config), fields(user = layout.user()))]
    pub async fn open(
        layout: ProfileLayout,
        source: Arc<dyn CatalogSource>,
        asset_config: AssetCacheConfig,
    ) -> Result<Self, SessionError> {
        let mut guard = SessionGuard::new(layout);
        let seed = guard.bootstrap()?;
        debug!("Profile bootstrap: {:?}", seed);
        guard.acquire()?;

        let repository = Arc::new(NodeRepository::new(Arc::clone(&source)));
        repository.load_root().await?;
        let assets = Arc::new(AssetCache::new(source, asset_config));

        let (icon_tx, icon_rx) = mpsc::unbounded_channel();
        info!("Catalog session opened for {}", guard.layout().user());

        Ok(Self {
            repository,
            assets,
            pending: Arc::new(DashMap::new()),
            icon_tx,
            icon_rx: Some(icon_rx),
            guard,
        })
    }

    pub fn repository(&self) -> &NodeRepository {
        &self.repository
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    pub fn layout(&self) -> &ProfileLayout {
        self.guard.layout()
    }

    /// Receiver of delivered icon batches. Can be taken once.
    pub fn icon_batches(&mut self) -> Option<mpsc::UnboundedReceiver<IconBatch>> {
        self.icon_rx.take()
    }

    pub async fn roots(&self) -> Vec<CatalogNode> {
        self.repository.roots().await
    }

    /// Expand a node: merge its documents, return its children and start
    /// prefetching their icons.
    #[instrument(skip(self), level = "debug")]
    pub async fn expand(&self, node_id: &str) -> Vec<CatalogNode> {
        let children = self.repository.expand_documents(node_id).await;
        if !children.is_empty() {
            let image_ids: BTreeSet<AssetId> = children.iter().map(|n| n.image_id).collect();
            self.prefetch(node_id, image_ids);
        }
        children
    }

    /// Collapse a node, abandoning its pending icon prefetch.
    pub fn collapse(&self, node_id: &str) {
        if let Some((_, pending)) = self.pending.remove(node_id) {
            debug!("Cancelled icon prefetch {} for {}", pending.request_id, node_id);
            pending.cancel();
        }
    }

    /// Icon for one asset, from cache or backend.
    pub async fn icon(&self, image_id: AssetId) -> Result<Bytes, AssetError> {
        self.assets.get(image_id).await
    }

    /// Reload the catalog. Pending prefetches are abandoned; on failure the
    /// previous catalog stays in place.
    pub async fn reload(&self) -> Result<(), SessionError> {
        self.cancel_all();
        self.repository.load_root().await?;
        Ok(())
    }

    /// Abandon all prefetches and release the profile.
    pub fn close(mut self) {
        self.cancel_all();
        self.guard.release();
        info!("Catalog session closed");
    }

    /// Number of prefetches still in flight.
    pub fn pending_prefetches(&self) -> usize {
        self.pending.len()
    }

    fn cancel_all(&self) {
        let node_ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for node_id in node_ids {
            self.collapse(&node_id);
        }
    }

    fn prefetch(&self, node_id: &str, image_ids: BTreeSet<AssetId>) {
        let request_id = Uuid::new_v4();
        let replaced = self.pending.insert(
            node_id.to_string(),
            PendingPrefetch {
                request_id,
                abort: None,
            },
        );
        if let Some(previous) = replaced {
            previous.cancel();
        }

        let assets = Arc::clone(&self.assets);
        let pending = Arc::clone(&self.pending);
        let icon_tx = self.icon_tx.clone();
        let owner = node_id.to_string();

        let task = tokio::spawn(async move {
            let result = assets.batch_get(image_ids).await;

            // Deliver only if this is still the node's current request.
            if pending
                .remove_if(&owner, |_, p| p.request_id == request_id)
                .is_none()
            {
                debug!("Discarding stale icon batch {} for {}", request_id, owner);
                return;
            }

            match result {
                Ok(icons) => {
                    let batch = IconBatch {
                        node_id: owner,
                        request_id,
                        icons,
                    };
                    if icon_tx.send(batch).is_err() {
                        debug!("Icon receiver dropped, batch {} discarded", request_id);
                    }
                }
                Err(e) => warn!("Icon prefetch for {} failed: {}", owner, e),
            }
        });

        // The task may already have finished and removed its entry.
        if let Some(mut entry) = self.pending.get_mut(node_id) {
            if entry.request_id == request_id {
                entry.abort = Some(task.abort_handle());
            }
        }
    }
}

impl Drop for CatalogSession {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
