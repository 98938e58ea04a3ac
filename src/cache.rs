/// Resident tile cache.
///
/// Every tile coordinate moves through `Unrequested -> Pending -> Resident`
/// or `Pending -> Failed`. The cache is driven by the viewport rather than by
/// a capacity bound: a viewport change requests the covering tiles, and
/// anything outside the retention window is dropped.
///
/// # Concurrency
///
/// The tile table and the feature index sit behind one `RwLock`, so a tile
/// is admitted (or evicted) together with its index entries and a reader
/// never sees one without the other. Fetches run as tasks on the runtime the
/// cache was built with. A second request for a coordinate that is already
/// pending joins the existing fetch through a shared future instead of
/// issuing another one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::CachePolicy;
use crate::coord::{TileCoordinate, Viewport};
use crate::error::TileError;
use crate::feature::DecodedTile;
use crate::filter::Filter;
use crate::index::{FeatureIndex, LoadedFeature};
use crate::mvt::decode_tile;
use crate::resolver::ResolvedSource;
use crate::TileFetcher;

type TileResult = Result<Arc<DecodedTile>, TileError>;
type SharedFetch = Shared<BoxFuture<'static, TileResult>>;

/// Observable lifecycle state of one tile coordinate.
#[derive(Clone, Debug, PartialEq)]
pub enum TileStatus {
    Unrequested,
    Pending,
    Resident,
    Failed(TileError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub pending: usize,
    pub resident: usize,
    pub failed: usize,
    pub features: usize,
}

struct PendingFetch {
    generation: u64,
    cancel: CancellationToken,
    fetch: SharedFetch,
    /// Direct loads currently awaiting this fetch. Pinned fetches survive
    /// eviction.
    pins: usize,
}

enum Slot {
    Pending(PendingFetch),
    Resident(Arc<DecodedTile>),
    Failed(TileError),
}

#[derive(Default)]
struct TileStore {
    slots: BTreeMap<TileCoordinate, Slot>,
    index: FeatureIndex,
    viewport: Option<Viewport>,
}

impl TileStore {
    fn resident(&self, coordinate: &TileCoordinate) -> Option<&DecodedTile> {
        match self.slots.get(coordinate) {
            Some(Slot::Resident(tile)) => Some(tile.as_ref()),
            _ => None,
        }
    }

    fn evict(&mut self, coordinate: &TileCoordinate) {
        match self.slots.remove(coordinate) {
            Some(Slot::Resident(tile)) => {
                self.index.remove(&tile);
                debug!(tile = %coordinate, "Evicted tile");
            }
            Some(Slot::Pending(pending)) => {
                pending.cancel.cancel();
                debug!(tile = %coordinate, "Cancelled tile fetch");
            }
            Some(Slot::Failed(_)) | None => {}
        }
    }
}

struct CacheInner {
    source: String,
    store: RwLock<TileStore>,
    fetcher: Arc<dyn TileFetcher>,
    policy: CachePolicy,
    runtime: Handle,
    generations: AtomicU64,
    in_flight: watch::Sender<usize>,
}

impl CacheInner {
    /// Settles a fetch. The outcome is only applied if the slot still
    /// belongs to this fetch; a newer request or an eviction wins.
    fn finish(&self, coordinate: TileCoordinate, generation: u64, outcome: TileResult) -> TileResult {
        {
            let mut store = self.store.write();
            let current = matches!(
                store.slots.get(&coordinate),
                Some(Slot::Pending(pending)) if pending.generation == generation
            );
            if current {
                match &outcome {
                    Ok(tile) => {
                        store.index.insert(tile);
                        store.slots.insert(coordinate, Slot::Resident(tile.clone()));
                        debug!(
                            source = %self.source,
                            tile = %coordinate,
                            features = tile.feature_count(),
                            "Admitted tile"
                        );
                    }
                    Err(TileError::Cancelled) => {
                        store.slots.remove(&coordinate);
                    }
                    Err(e) => {
                        error!(source = %self.source, tile = %coordinate, error = %e, "Tile failed");
                        store.slots.insert(coordinate, Slot::Failed(e.clone()));
                    }
                }
            }
        }
        self.in_flight.send_modify(|count| *count = count.saturating_sub(1));
        outcome
    }
}

/// Fetches and decodes one tile, retrying transport failures with backoff.
/// Decode failures are final: the same bytes would fail again.
async fn fetch_with_retry(
    fetcher: Arc<dyn TileFetcher>,
    policy: CachePolicy,
    coordinate: TileCoordinate,
    url: String,
    extent: u32,
) -> TileResult {
    let mut failures = 0u32;
    loop {
        debug!(tile = %coordinate, url = %url, attempt = failures + 1, "Fetching tile");
        match fetcher.fetch(&url).await {
            Ok(bytes) => {
                return decode_tile(coordinate, &bytes, extent)
                    .map(Arc::new)
                    .map_err(TileError::from);
            }
            Err(e) => {
                failures += 1;
                if failures >= policy.max_fetch_attempts {
                    return Err(e.into());
                }
                let delay = policy.retry_backoff(failures);
                warn!(
                    tile = %coordinate,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Tile fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Releases a direct load's hold on a pending fetch.
struct PinGuard<'a> {
    cache: &'a CacheInner,
    coordinate: TileCoordinate,
    generation: u64,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        let mut store = self.cache.store.write();
        if let Some(Slot::Pending(pending)) = store.slots.get_mut(&self.coordinate) {
            if pending.generation == self.generation {
                pending.pins = pending.pins.saturating_sub(1);
            }
        }
    }
}

pub struct TileCache {
    inner: Arc<CacheInner>,
}

impl TileCache {
    pub fn new(
        source: &str,
        fetcher: Arc<dyn TileFetcher>,
        policy: CachePolicy,
        runtime: Handle,
    ) -> TileCache {
        let (in_flight, _) = watch::channel(0);
        TileCache {
            inner: Arc::new(CacheInner {
                source: source.to_owned(),
                store: RwLock::new(TileStore::default()),
                fetcher,
                policy,
                runtime,
                generations: AtomicU64::new(0),
                in_flight,
            }),
        }
    }

    /// Inserts a pending slot for `coordinate` and spawns its fetch.
    fn start_fetch(
        &self,
        store: &mut TileStore,
        resolved: &ResolvedSource,
        coordinate: TileCoordinate,
        pins: usize,
    ) -> (u64, SharedFetch) {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let cache: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let token = cancel.clone();
        let work = fetch_with_retry(
            self.inner.fetcher.clone(),
            self.inner.policy.clone(),
            coordinate,
            resolved.tile_url(coordinate),
            resolved.extent,
        );
        let fetch = async move {
            // Dropping `work` on cancellation abandons any response in flight.
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(TileError::Cancelled),
                outcome = work => outcome,
            };
            match cache.upgrade() {
                Some(cache) => cache.finish(coordinate, generation, outcome),
                None => Err(TileError::Cancelled),
            }
        }
        .boxed()
        .shared();

        store.slots.insert(
            coordinate,
            Slot::Pending(PendingFetch {
                generation,
                cancel,
                fetch: fetch.clone(),
                pins,
            }),
        );
        self.inner.in_flight.send_modify(|count| *count += 1);
        self.inner.runtime.spawn(fetch.clone());
        (generation, fetch)
    }

    /// Requests every tile in `tiles` that is not already pending, resident
    /// or failed. Returns how many fetches were started.
    pub fn request(&self, resolved: &ResolvedSource, tiles: &[TileCoordinate]) -> usize {
        let mut store = self.inner.store.write();
        let mut started = 0;
        for coordinate in tiles {
            if !store.slots.contains_key(coordinate) {
                let _ = self.start_fetch(&mut store, resolved, *coordinate, 0);
                started += 1;
            }
        }
        started
    }

    /// Applies a viewport change: evicts everything outside the retention
    /// window, clears failures inside a changed viewport so they are tried
    /// again, and requests the covering tiles. Returns how many fetches were
    /// started.
    pub fn update_viewport(&self, resolved: &ResolvedSource, viewport: Viewport) -> usize {
        let mut store = self.inner.store.write();
        self.apply_viewport(&mut store, resolved, viewport)
    }

    /// Applies `viewport` only if no viewport has been applied since the
    /// cache was created or cleared. Used to replay a viewport that arrived
    /// before the source was resolved without overriding a newer one.
    pub fn restore_viewport(&self, resolved: &ResolvedSource, viewport: Viewport) -> usize {
        let mut store = self.inner.store.write();
        if store.viewport.is_some() {
            return 0;
        }
        self.apply_viewport(&mut store, resolved, viewport)
    }

    fn apply_viewport(
        &self,
        store: &mut TileStore,
        resolved: &ResolvedSource,
        viewport: Viewport,
    ) -> usize {
        let covering = resolved.covering_tiles(&viewport);
        let window = viewport.retention_window(
            resolved.min_zoom,
            resolved.max_zoom,
            self.inner.policy.margin,
            self.inner.policy.neighbor_zoom_levels,
        );

        let changed = store.viewport != Some(viewport);
        store.viewport = Some(viewport);

        let stale: Vec<TileCoordinate> = store
            .slots
            .iter()
            .filter(|(coordinate, slot)| {
                let retained = window.contains(*coordinate);
                match slot {
                    Slot::Pending(pending) => !retained && pending.pins == 0,
                    Slot::Failed(_) => !retained || (changed && covering.contains(*coordinate)),
                    Slot::Resident(_) => !retained,
                }
            })
            .map(|(coordinate, _)| *coordinate)
            .collect();
        for coordinate in &stale {
            store.evict(coordinate);
        }

        let mut started = 0;
        for coordinate in covering {
            if !store.slots.contains_key(&coordinate) {
                let _ = self.start_fetch(store, resolved, coordinate, 0);
                started += 1;
            }
        }
        debug!(
            source = %self.inner.source,
            zoom = viewport.zoom,
            started,
            dropped = stale.len(),
            "Viewport updated"
        );
        started
    }

    /// Returns the tile at `coordinate`, joining an in-flight fetch or
    /// starting one. While this waits the fetch is pinned against eviction.
    pub async fn load(
        &self,
        resolved: &ResolvedSource,
        coordinate: TileCoordinate,
    ) -> Result<Arc<DecodedTile>, TileError> {
        let (generation, fetch) = {
            let mut store = self.inner.store.write();
            match store.slots.get_mut(&coordinate) {
                Some(Slot::Resident(tile)) => return Ok(tile.clone()),
                Some(Slot::Pending(pending)) => {
                    pending.pins += 1;
                    (pending.generation, pending.fetch.clone())
                }
                Some(Slot::Failed(_)) | None => self.start_fetch(&mut store, resolved, coordinate, 1),
            }
        };
        let _pin = PinGuard {
            cache: &self.inner,
            coordinate,
            generation,
        };
        fetch.await
    }

    /// Features of the resident tiles, read under one consistent snapshot.
    pub fn query(&self, layers: &BTreeSet<String>, filter: Option<&Filter>) -> Vec<LoadedFeature> {
        let store = self.inner.store.read();
        store.index.query(layers, filter, |coordinate| store.resident(coordinate))
    }

    pub fn status(&self, coordinate: &TileCoordinate) -> TileStatus {
        match self.inner.store.read().slots.get(coordinate) {
            None => TileStatus::Unrequested,
            Some(Slot::Pending(_)) => TileStatus::Pending,
            Some(Slot::Resident(_)) => TileStatus::Resident,
            Some(Slot::Failed(e)) => TileStatus::Failed(e.clone()),
        }
    }

    pub fn resident_tiles(&self) -> Vec<TileCoordinate> {
        let store = self.inner.store.read();
        store
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Resident(_)))
            .map(|(coordinate, _)| *coordinate)
            .collect()
    }

    pub fn source_layers(&self) -> Vec<String> {
        let store = self.inner.store.read();
        store.index.layer_names().into_iter().map(str::to_owned).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.inner.store.read();
        let mut stats = CacheStats::default();
        for slot in store.slots.values() {
            match slot {
                Slot::Pending(_) => stats.pending += 1,
                Slot::Resident(tile) => {
                    stats.resident += 1;
                    stats.features += tile.feature_count();
                }
                Slot::Failed(_) => stats.failed += 1,
            }
        }
        stats
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Resolves once no fetch is in flight.
    pub async fn settled(&self) {
        let mut in_flight = self.inner.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = in_flight.wait_for(|count| *count == 0).await;
    }

    /// Cancels every fetch, pinned or not, and releases all tiles.
    pub fn clear(&self) {
        let mut store = self.inner.store.write();
        for slot in store.slots.values() {
            if let Slot::Pending(pending) = slot {
                pending.cancel.cancel();
            }
        }
        store.slots.clear();
        store.index.clear();
        store.viewport = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use prost::Message;

    use super::*;
    use crate::config::SourceOptions;
    use crate::error::FetchError;
    use crate::mvt::proto;

    /// Serves canned responses per URL and counts calls. While `gate` is
    /// closed every fetch waits.
    struct FakeFetcher {
        responses: Mutex<HashMap<String, Result<Vec<u8>, FetchError>>>,
        calls: Mutex<HashMap<String, usize>>,
        gate: watch::Sender<bool>,
    }

    impl FakeFetcher {
        fn new(open: bool) -> Arc<FakeFetcher> {
            let (gate, _) = watch::channel(open);
            Arc::new(FakeFetcher {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                gate,
            })
        }

        fn respond(&self, url: &str, response: Result<Vec<u8>, FetchError>) {
            self.responses.lock().insert(url.to_owned(), response);
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }

        fn open(&self) {
            self.gate.send_replace(true);
        }
    }

    #[async_trait]
    impl TileFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            *self.calls.lock().entry(url.to_owned()).or_default() += 1;
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            self.responses
                .lock()
                .get(url)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn roads_tile() -> Vec<u8> {
        proto::Tile {
            layers: vec![proto::Layer {
                name: "roads".to_owned(),
                features: vec![proto::Feature {
                    id: Some(1),
                    tags: vec![],
                    r#type: Some(proto::GeomType::Linestring as i32),
                    // MoveTo(10,10) LineTo(+10,+10)
                    geometry: vec![9, 20, 20, 10, 20, 20],
                }],
                keys: vec![],
                values: vec![],
                extent: Some(4096),
                version: 2,
            }],
        }
        .encode_to_vec()
    }

    fn resolved() -> ResolvedSource {
        let options = SourceOptions {
            minimum_zoom_level: 9,
            maximum_zoom_level: 16,
            cache: CachePolicy {
                neighbor_zoom_levels: 0,
                retry_base_delay_ms: 10,
                ..CachePolicy::default()
            },
            ..SourceOptions::default()
        };
        ResolvedSource::from_templates(&["https://ex.com/{z}/{x}/{y}.mvt".to_owned()], &options)
            .expect("resolve")
    }

    fn cache(fetcher: Arc<FakeFetcher>) -> TileCache {
        let policy = CachePolicy {
            neighbor_zoom_levels: 0,
            retry_base_delay_ms: 10,
            ..CachePolicy::default()
        };
        TileCache::new("test", fetcher, policy, Handle::current())
    }

    fn names(layers: &[&str]) -> BTreeSet<String> {
        layers.iter().map(|s| s.to_string()).collect()
    }

    const URL: &str = "https://ex.com/10/5/5.mvt";

    #[tokio::test]
    async fn test_viewport_loads_and_indexes_tile() {
        let fetcher = FakeFetcher::new(true);
        fetcher.respond(URL, Ok(roads_tile()));
        let cache = cache(fetcher.clone());
        let tile = TileCoordinate::new(10, 5, 5);

        assert_eq!(1, cache.update_viewport(&resolved(), Viewport::single(tile)));
        assert_eq!(TileStatus::Pending, cache.status(&tile));
        cache.settled().await;

        assert_eq!(TileStatus::Resident, cache.status(&tile));
        assert_eq!(1, cache.query(&names(&["roads"]), None).len());
        assert!(cache.query(&names(&["water"]), None).is_empty());
        assert_eq!(vec!["roads".to_owned()], cache.source_layers());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let fetcher = FakeFetcher::new(false);
        fetcher.respond(URL, Ok(roads_tile()));
        let cache = cache(fetcher.clone());
        let resolved = resolved();
        let tile = TileCoordinate::new(10, 5, 5);

        cache.update_viewport(&resolved, Viewport::single(tile));
        assert_eq!(0, cache.request(&resolved, &[tile]));
        assert_eq!(0, cache.update_viewport(&resolved, Viewport::single(tile)));

        let opener = async {
            tokio::task::yield_now().await;
            fetcher.open();
        };
        let (a, b, _) = tokio::join!(cache.load(&resolved, tile), cache.load(&resolved, tile), opener);
        let (a, b) = (a.expect("first load"), b.expect("second load"));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(1, fetcher.calls(URL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_retry_then_fail() {
        let fetcher = FakeFetcher::new(true);
        fetcher.respond(
            URL,
            Err(FetchError::Status {
                url: URL.to_owned(),
                status: 503,
            }),
        );
        let cache = cache(fetcher.clone());
        let resolved = resolved();
        let tile = TileCoordinate::new(10, 5, 5);

        cache.update_viewport(&resolved, Viewport::single(tile));
        cache.settled().await;

        assert_eq!(3, fetcher.calls(URL));
        assert!(matches!(cache.status(&tile), TileStatus::Failed(TileError::Fetch(_))));

        // Same viewport: the failure sticks.
        cache.update_viewport(&resolved, Viewport::single(tile));
        cache.settled().await;
        assert_eq!(3, fetcher.calls(URL));
    }

    #[tokio::test]
    async fn test_decode_errors_are_not_retried() {
        let fetcher = FakeFetcher::new(true);
        fetcher.respond(URL, Ok(vec![0xff, 0xff, 0xff, 0x01]));
        let cache = cache(fetcher.clone());
        let resolved = resolved();
        let tile = TileCoordinate::new(10, 5, 5);

        cache.update_viewport(&resolved, Viewport::single(tile));
        cache.settled().await;

        assert_eq!(1, fetcher.calls(URL));
        assert!(matches!(cache.status(&tile), TileStatus::Failed(TileError::Decode(_))));
        assert!(cache.query(&names(&["roads"]), None).is_empty());

        // A different viewport still covering the tile tries again.
        cache.update_viewport(&resolved, Viewport::new(10, (5, 6), (5, 5)));
        cache.settled().await;
        assert_eq!(2, fetcher.calls(URL));
    }

    #[tokio::test]
    async fn test_eviction_drops_features_and_cancels_fetches() {
        let fetcher = FakeFetcher::new(true);
        fetcher.respond(URL, Ok(roads_tile()));
        fetcher.respond("https://ex.com/10/6/5.mvt", Ok(roads_tile()));
        let cache = cache(fetcher.clone());
        let resolved = resolved();

        cache.update_viewport(&resolved, Viewport::new(10, (5, 6), (5, 5)));
        cache.settled().await;
        assert_eq!(2, cache.query(&names(&["roads"]), None).len());

        // Far away: both tiles leave the retention window.
        fetcher.gate.send_replace(false);
        let far = TileCoordinate::new(10, 100, 100);
        cache.update_viewport(&resolved, Viewport::single(far));
        assert!(cache.query(&names(&["roads"]), None).is_empty());
        assert_eq!(TileStatus::Pending, cache.status(&far));

        // Back again: the pending far tile is cancelled, never admitted.
        cache.update_viewport(&resolved, Viewport::new(10, (5, 6), (5, 5)));
        assert_eq!(TileStatus::Unrequested, cache.status(&far));
        fetcher.open();
        cache.settled().await;

        let results = cache.query(&names(&["roads"]), None);
        assert_eq!(2, results.len());
        assert_eq!(
            CacheStats {
                pending: 0,
                resident: 2,
                failed: 0,
                features: 2
            },
            cache.stats()
        );
    }

    #[tokio::test]
    async fn test_awaited_load_survives_viewport_change() {
        let fetcher = FakeFetcher::new(false);
        fetcher.respond(URL, Ok(roads_tile()));
        let cache = cache(fetcher.clone());
        let resolved = resolved();
        let tile = TileCoordinate::new(10, 5, 5);

        let move_away = async {
            tokio::task::yield_now().await;
            assert_eq!(TileStatus::Pending, cache.status(&tile));
            cache.update_viewport(&resolved, Viewport::single(TileCoordinate::new(10, 100, 100)));
            // Outside the window, but still awaited.
            assert_eq!(TileStatus::Pending, cache.status(&tile));
            fetcher.open();
        };
        let (loaded, ()) = tokio::join!(cache.load(&resolved, tile), move_away);

        let loaded = loaded.expect("pinned load must complete");
        assert_eq!(1, loaded.feature_count());
        assert_eq!(TileStatus::Resident, cache.status(&tile));
        assert_eq!(1, cache.query(&names(&["roads"]), None).len());
        assert_eq!(1, fetcher.calls(URL));
    }

    #[tokio::test]
    async fn test_clear_releases_everything() {
        let fetcher = FakeFetcher::new(true);
        fetcher.respond(URL, Ok(roads_tile()));
        let cache = cache(fetcher.clone());
        let resolved = resolved();

        cache.update_viewport(&resolved, Viewport::single(TileCoordinate::new(10, 5, 5)));
        cache.settled().await;
        fetcher.gate.send_replace(false);
        cache.request(&resolved, &[TileCoordinate::new(10, 9, 9)]);

        cache.clear();
        cache.settled().await;
        assert!(cache.resident_tiles().is_empty());
        assert_eq!(CacheStats::default(), cache.stats());
        assert_eq!(0, cache.in_flight());
    }
}
