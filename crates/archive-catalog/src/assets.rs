//! Asset cache for tree icons.
//!
//! Maps asset ids to blob bytes fetched from the `CatalogSource`. Misses are
//! fetched in batches, each id at most once per session, and anything the
//! backend cannot resolve maps to one shared fallback asset.
//!
//! A lookup claims the ids nobody is fetching yet and issues one round trip
//! for them; ids already claimed by another lookup are awaited instead. The
//! ledger lock only covers that bookkeeping, never a backend call.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use archive_catalog_core::{AssetId, AssetMap, CatalogSource};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::error::AssetError;

/// Built-in fallback: a 1x1 transparent PNG.
pub const PLACEHOLDER_ICON: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Asset cache settings.
#[derive(Debug, Clone)]
pub struct AssetCacheConfig {
    /// Backend asset used in place of unresolved ids; the built-in
    /// placeholder is used when unset or unresolvable
    pub fallback_asset_id: Option<AssetId>,
    /// Reject blobs that do not start with a known image signature
    pub validate_format: bool,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self {
            fallback_asset_id: None,
            validate_format: true,
        }
    }
}

/// Detect the image format from a blob's leading bytes.
pub fn sniff_image_format(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [b'B', b'M', ..] => Some("bmp"),
        [0x00, 0x00, 0x01, 0x00, ..] => Some("ico"),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some("tiff"),
        _ => None,
    }
}

/// Closes when the round trip that owns it ends, whatever the outcome.
type Completion = watch::Receiver<()>;

#[derive(Debug)]
enum FallbackState {
    /// The configured fallback asset has not been fetched yet
    Unprobed(AssetId),
    /// A round trip carrying the fallback asset is in flight
    Probing(Completion),
    /// `None` until some lookup needs the built-in placeholder
    Settled(Option<Bytes>),
}

/// Who is fetching what. Cache entries are only written while this is locked.
#[derive(Debug)]
struct Ledger {
    in_flight: HashMap<AssetId, Completion>,
    fallback: FallbackState,
}

/// Ownership of a set of ids, and possibly the fallback probe, for one
/// round trip. Dropping it hands them back, so a failed or cancelled fetch
/// never strands waiters.
struct Claim<'a> {
    cache: &'a AssetCache,
    ids: BTreeSet<AssetId>,
    probe: Option<AssetId>,
    _done: watch::Sender<()>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut ledger = self.cache.ledger();
        for id in &self.ids {
            ledger.in_flight.remove(id);
        }
        if let Some(fallback_id) = self.probe {
            if matches!(ledger.fallback, FallbackState::Probing(_)) {
                ledger.fallback = FallbackState::Unprobed(fallback_id);
            }
        }
    }
}

enum FallbackStep<'a> {
    Ready(Bytes),
    Wait(Completion),
    Probe(Claim<'a>),
}

/// Deduplicating, fallback-aware cache of asset blobs.
pub struct AssetCache {
    source: Arc<dyn CatalogSource>,
    config: AssetCacheConfig,
    entries: DashMap<AssetId, Bytes>,
    ledger: Mutex<Ledger>,
}

impl AssetCache {
    pub fn new(source: Arc<dyn CatalogSource>, config: AssetCacheConfig) -> Self {
        let fallback = match config.fallback_asset_id {
            Some(fallback_id) => FallbackState::Unprobed(fallback_id),
            None => FallbackState::Settled(None),
        };
        Self {
            source,
            config,
            entries: DashMap::new(),
            ledger: Mutex::new(Ledger {
                in_flight: HashMap::new(),
                fallback,
            }),
        }
    }

    /// Bytes for one asset, fetching it on a miss.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, id: AssetId) -> Result<Bytes, AssetError> {
        if let Some(bytes) = self.entries.get(&id) {
            return Ok(bytes.clone());
        }
        let mut resolved = self.batch_get([id]).await?;
        Ok(resolved
            .remove(&id)
            .unwrap_or_else(|| Bytes::from_static(PLACEHOLDER_ICON)))
    }

    /// Bytes for a set of assets, fetching every unclaimed miss in one
    /// round trip.
    ///
    /// Ids another lookup is already fetching are awaited, not refetched.
    /// Ids the backend cannot resolve map to the fallback asset. A failed
    /// round trip leaves the cache untouched.
    #[instrument(skip(self, ids), level = "debug")]
    pub async fn batch_get(
        &self,
        ids: impl IntoIterator<Item = AssetId> + Send,
    ) -> Result<HashMap<AssetId, Bytes>, AssetError> {
        let wanted: BTreeSet<AssetId> = ids.into_iter().collect();
        let mut resolved = HashMap::with_capacity(wanted.len());
        let mut missing = self.take_cached(wanted, &mut resolved);

        while !missing.is_empty() {
            let (claim, waits) = self.claim(&missing, &mut resolved);
            if let Some(claim) = claim {
                self.fetch(claim, &mut resolved).await?;
            }
            for mut completion in waits {
                // Only closes; an error here means the owner is done.
                let _ = completion.changed().await;
            }

            // Ids whose owner failed are still missing and get claimed next.
            missing.retain(|id| !resolved.contains_key(id));
            missing = self.take_cached(missing, &mut resolved);
        }

        Ok(resolved)
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Split `missing` into cached ids, ids in flight elsewhere (returned as
    /// completions to await) and ids this call now owns.
    fn claim(
        &self,
        missing: &BTreeSet<AssetId>,
        resolved: &mut HashMap<AssetId, Bytes>,
    ) -> (Option<Claim<'_>>, Vec<Completion>) {
        let mut guard = self.ledger();
        let ledger = &mut *guard;
        let (done, completion) = watch::channel(());
        let mut owned = BTreeSet::new();
        let mut waits = Vec::new();

        for &id in missing {
            if let Some(bytes) = self.entries.get(&id) {
                resolved.insert(id, bytes.clone());
                continue;
            }
            match ledger.in_flight.get(&id) {
                Some(other) => waits.push(other.clone()),
                None => {
                    ledger.in_flight.insert(id, completion.clone());
                    owned.insert(id);
                }
            }
        }
        if owned.is_empty() {
            return (None, waits);
        }

        // The configured fallback rides along with the first round trip.
        let probe = match ledger.fallback {
            FallbackState::Unprobed(fallback_id) => {
                ledger.fallback = FallbackState::Probing(completion);
                Some(fallback_id)
            }
            _ => None,
        };

        let claim = Claim {
            cache: self,
            ids: owned,
            probe,
            _done: done,
        };
        (Some(claim), waits)
    }

    /// Run the round trip for a claim and publish its results.
    async fn fetch(
        &self,
        claim: Claim<'_>,
        resolved: &mut HashMap<AssetId, Bytes>,
    ) -> Result<(), AssetError> {
        let mut request = claim.ids.clone();
        request.extend(claim.probe);

        let mut fetched = self.round_trip(&request).await?;
        if let Some(fallback_id) = claim.probe {
            self.settle_probe(fallback_id, &fetched);
        }

        let mut blobs = Vec::with_capacity(claim.ids.len());
        let mut unresolved = Vec::new();
        for &id in &claim.ids {
            match fetched.remove(&id).flatten().and_then(|b| self.accept(id, b)) {
                Some(bytes) => blobs.push((id, bytes)),
                None => unresolved.push(id),
            }
        }
        if !unresolved.is_empty() {
            let fallback = self.fallback_bytes().await?;
            blobs.extend(unresolved.into_iter().map(|id| (id, fallback.clone())));
        }

        {
            let _ledger = self.ledger();
            for (id, bytes) in blobs {
                self.entries.insert(id, bytes.clone());
                resolved.insert(id, bytes);
            }
        }
        drop(claim);
        Ok(())
    }

    async fn round_trip(&self, request: &BTreeSet<AssetId>) -> Result<AssetMap, AssetError> {
        let fetched = self.source.fetch_assets(request).await.map_err(|e| {
            warn!("Asset round trip for {} id(s) failed: {}", request.len(), e);
            AssetError::from(e)
        })?;
        debug!(
            "Fetched {} of {} requested asset(s)",
            fetched.len(),
            request.len()
        );
        Ok(fetched)
    }

    fn settle_probe(&self, fallback_id: AssetId, fetched: &AssetMap) {
        let candidate = fetched
            .get(&fallback_id)
            .cloned()
            .flatten()
            .and_then(|b| self.accept(fallback_id, b));
        self.ledger().fallback = FallbackState::Settled(candidate);
    }

    /// The shared fallback, probing the configured asset on its own if no
    /// batch has carried it yet.
    async fn fallback_bytes(&self) -> Result<Bytes, AssetError> {
        loop {
            match self.fallback_step() {
                FallbackStep::Ready(bytes) => return Ok(bytes),
                FallbackStep::Wait(mut completion) => {
                    let _ = completion.changed().await;
                }
                FallbackStep::Probe(claim) => {
                    if let Some(fallback_id) = claim.probe {
                        let fetched = self.round_trip(&BTreeSet::from([fallback_id])).await?;
                        self.settle_probe(fallback_id, &fetched);
                    }
                    drop(claim);
                }
            }
        }
    }

    fn fallback_step(&self) -> FallbackStep<'_> {
        let mut guard = self.ledger();
        let ledger = &mut *guard;
        if let FallbackState::Settled(Some(bytes)) = &ledger.fallback {
            return FallbackStep::Ready(bytes.clone());
        }
        if let FallbackState::Probing(completion) = &ledger.fallback {
            return FallbackStep::Wait(completion.clone());
        }
        if let FallbackState::Unprobed(fallback_id) = ledger.fallback {
            let (done, completion) = watch::channel(());
            ledger.fallback = FallbackState::Probing(completion);
            return FallbackStep::Probe(Claim {
                cache: self,
                ids: BTreeSet::new(),
                probe: Some(fallback_id),
                _done: done,
            });
        }

        let bytes = Bytes::from_static(PLACEHOLDER_ICON);
        ledger.fallback = FallbackState::Settled(Some(bytes.clone()));
        FallbackStep::Ready(bytes)
    }

    /// Move cached ids into `resolved`, returning the ids still missing.
    fn take_cached(
        &self,
        ids: BTreeSet<AssetId>,
        resolved: &mut HashMap<AssetId, Bytes>,
    ) -> BTreeSet<AssetId> {
        ids.into_iter()
            .filter(|id| match self.entries.get(id) {
                Some(bytes) => {
                    resolved.insert(*id, bytes.clone());
                    false
                }
                None => true,
            })
            .collect()
    }

    /// Validate a fetched blob; `None` means the id resolves to the fallback.
    fn accept(&self, id: AssetId, bytes: Bytes) -> Option<Bytes> {
        if bytes.is_empty() {
            debug!("Empty blob for asset {}", id);
            return None;
        }
        if self.config.validate_format && sniff_image_format(&bytes).is_none() {
            warn!("Asset {} is not a recognized image ({} bytes)", id, bytes.len());
            return None;
        }
        Some(bytes)
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ids some lookup is currently fetching.
    pub fn in_flight(&self) -> usize {
        self.ledger().in_flight.len()
    }

    /// The fallback asset, once some lookup has needed or probed it.
    pub fn fallback(&self) -> Option<Bytes> {
        match &self.ledger().fallback {
            FallbackState::Settled(bytes) => bytes.clone(),
            _ => None,
        }
    }
}
