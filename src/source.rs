/// The vector tile source a map style attaches.
///
/// A source is configured in one of three ways: a TileJSON URL, a TileJSON
/// URL kept as a raw string, or explicit tile URL templates. Nothing is
/// fetched until the source is attached to a runtime and given a viewport.
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Url;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, TileCache, TileStatus};
use crate::config::{AttributionInfo, SourceConfig, SourceLocation, SourceOptions};
use crate::coord::{TileCoordinate, Viewport};
use crate::error::{Error, FetchError};
use crate::feature::DecodedTile;
use crate::filter::Filter;
use crate::index::LoadedFeature;
use crate::resolver::{ResolvedSource, Resolver};
use crate::tilejson::{TileJson, VectorLayer};
use crate::TileFetcher;

struct Attachment {
    cache: Arc<TileCache>,
    shutdown: CancellationToken,
}

pub struct VectorTileSource {
    config: SourceConfig,
    resolver: Arc<Resolver>,
    attachment: RwLock<Option<Attachment>>,
}

impl VectorTileSource {
    /// A source described by the TileJSON document at `url`.
    pub fn with_configuration_url(
        identifier: &str,
        url: Url,
        options: SourceOptions,
    ) -> Result<VectorTileSource, Error> {
        VectorTileSource::new(SourceConfig::new(
            identifier,
            SourceLocation::ConfigurationUrl(url),
            options,
        )?)
    }

    /// Like [`VectorTileSource::with_configuration_url`], but the address is
    /// used exactly as given.
    pub fn with_configuration_url_string(
        identifier: &str,
        url: &str,
        options: SourceOptions,
    ) -> Result<VectorTileSource, Error> {
        VectorTileSource::new(SourceConfig::new(
            identifier,
            SourceLocation::ConfigurationUrlString(url.to_owned()),
            options,
        )?)
    }

    /// A source fetching tiles from explicit URL templates. Only the first
    /// template is used.
    pub fn with_tile_url_templates(
        identifier: &str,
        templates: Vec<String>,
        options: SourceOptions,
    ) -> Result<VectorTileSource, Error> {
        VectorTileSource::new(SourceConfig::new(
            identifier,
            SourceLocation::Templates(templates),
            options,
        )?)
    }

    pub fn new(config: SourceConfig) -> Result<VectorTileSource, Error> {
        let resolver = match &config.location {
            SourceLocation::Templates(templates) => Resolver::ready(ResolvedSource::from_templates(
                templates,
                &config.options,
            )?),
            SourceLocation::ConfigurationUrl(_) | SourceLocation::ConfigurationUrlString(_) => {
                Resolver::pending()
            }
        };
        Ok(VectorTileSource {
            config,
            resolver: Arc::new(resolver),
            attachment: RwLock::new(None),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn configuration(&self) -> &SourceConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.read().is_some()
    }

    /// Attaches the source to a map view. Tiles are fetched through
    /// `fetcher` on `runtime`. Sources configured by URL start loading their
    /// TileJSON document here. Re-attaching releases everything loaded under
    /// the previous attachment. A document that could not be fetched under
    /// an earlier attachment is fetched again.
    pub fn attach(&self, fetcher: Arc<dyn TileFetcher>, runtime: Handle) {
        self.detach();

        let cache = Arc::new(TileCache::new(
            &self.config.identifier,
            fetcher.clone(),
            self.config.options.cache.clone(),
            runtime.clone(),
        ));
        let shutdown = CancellationToken::new();

        if self.resolver.resolved().is_none() && self.resolver.reopen() {
            if let Some(url) = self.configuration_url() {
                runtime.spawn(load_tilejson(
                    self.config.identifier.clone(),
                    url,
                    self.config.options.clone(),
                    fetcher,
                    self.resolver.clone(),
                    cache.clone(),
                    shutdown.clone(),
                ));
            }
        }

        info!(source = %self.config.identifier, "Attached source");
        *self.attachment.write() = Some(Attachment { cache, shutdown });
    }

    /// Cancels every in-flight fetch and releases all resident tiles.
    pub fn detach(&self) {
        if let Some(attachment) = self.attachment.write().take() {
            attachment.shutdown.cancel();
            attachment.cache.clear();
            info!(source = %self.config.identifier, "Detached source");
        }
    }

    fn configuration_url(&self) -> Option<String> {
        match &self.config.location {
            SourceLocation::ConfigurationUrl(url) => Some(url.to_string()),
            SourceLocation::ConfigurationUrlString(url) => Some(url.clone()),
            SourceLocation::Templates(_) => None,
        }
    }

    fn cache(&self) -> Option<Arc<TileCache>> {
        self.attachment
            .read()
            .as_ref()
            .map(|attachment| attachment.cache.clone())
    }

    /// Reports a new viewport. Tiles covering it are requested and tiles
    /// outside the retention window are released. Before the source is
    /// resolved the viewport is held back and applied once it is.
    pub fn update_viewport(&self, viewport: Viewport) -> Result<(), Error> {
        let cache = self
            .cache()
            .ok_or_else(|| Error::NotAttached(self.config.identifier.clone()))?;
        match self.resolver.resolve_or_queue(viewport) {
            Some(resolved) => {
                cache.update_viewport(&resolved, viewport);
                Ok(())
            }
            None => match self.resolver.failure() {
                Some(e) => Err(e),
                None => {
                    debug!(source = %self.config.identifier, "Source not resolved yet, queued viewport");
                    Ok(())
                }
            },
        }
    }

    /// Returns the features of the named source layers in currently
    /// resident tiles, optionally narrowed by `filter`. Never fetches.
    /// Features spanning tile boundaries are returned once per tile.
    pub fn features_in_source_layers<I, S>(
        &self,
        source_layers: I,
        filter: Option<&Filter>,
    ) -> Result<Vec<LoadedFeature>, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let layers: BTreeSet<String> = source_layers
            .into_iter()
            .map(|layer| layer.as_ref().to_owned())
            .collect();
        if layers.is_empty() {
            return Err(Error::InvalidLayer);
        }
        Ok(self
            .cache()
            .map(|cache| cache.query(&layers, filter))
            .unwrap_or_default())
    }

    /// Loads a single tile, waiting for the source to resolve if needed. A
    /// fetch already underway for the tile is joined rather than repeated,
    /// and is kept alive while this waits.
    ///
    /// Tiles above the source's maximum zoom load their ancestor at the
    /// maximum zoom. Tiles below the minimum zoom or outside the source bounds
    /// do not exist.
    pub async fn load_tile(&self, coordinate: TileCoordinate) -> Result<Arc<DecodedTile>, Error> {
        if !coordinate.is_valid() {
            return Err(Error::InvalidTile(coordinate));
        }
        let cache = self
            .cache()
            .ok_or_else(|| Error::NotAttached(self.config.identifier.clone()))?;
        let resolved = self.resolver.wait().await?;
        let tile = resolved
            .source_tile(coordinate)
            .ok_or(Error::InvalidTile(coordinate))?;
        Ok(cache.load(&resolved, tile).await?)
    }

    pub fn tile_status(&self, coordinate: &TileCoordinate) -> TileStatus {
        self.cache()
            .map(|cache| cache.status(coordinate))
            .unwrap_or(TileStatus::Unrequested)
    }

    pub fn resident_tiles(&self) -> Vec<TileCoordinate> {
        self.cache()
            .map(|cache| cache.resident_tiles())
            .unwrap_or_default()
    }

    /// Source layers present in at least one resident tile.
    pub fn source_layers(&self) -> Vec<String> {
        self.cache()
            .map(|cache| cache.source_layers())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache().map(|cache| cache.stats()).unwrap_or_default()
    }

    /// Resolves once no tile fetch is in flight.
    pub async fn settled(&self) {
        if let Some(cache) = self.cache() {
            cache.settled().await;
        }
    }

    /// Resolves once the tile URL template is known.
    pub async fn ready(&self) -> Result<(), Error> {
        self.resolver.wait().await.map(|_| ())
    }

    pub fn attribution(&self) -> Vec<AttributionInfo> {
        match self.resolver.resolved() {
            Some(resolved) => resolved.attribution.clone(),
            None => self.config.options.attribution_infos.clone(),
        }
    }

    pub fn attribution_html(&self) -> Option<String> {
        match self.resolver.resolved() {
            Some(resolved) => resolved.attribution_html.clone(),
            None => self.config.options.attribution_html.clone(),
        }
    }

    /// The zoom levels tiles exist at, as `(minimum, maximum)`.
    pub fn zoom_range(&self) -> (u8, u8) {
        match self.resolver.resolved() {
            Some(resolved) => (resolved.min_zoom, resolved.max_zoom),
            None => (
                self.config.options.minimum_zoom_level,
                self.config.options.maximum_zoom_level,
            ),
        }
    }

    /// Layer metadata advertised by the TileJSON document, if any.
    pub fn vector_layers(&self) -> Vec<VectorLayer> {
        self.resolver
            .resolved()
            .map(|resolved| resolved.vector_layers.clone())
            .unwrap_or_default()
    }
}

impl Drop for VectorTileSource {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Fetches and applies the TileJSON document, then replays the most recent
/// viewport reported while it was loading. Fetch errors are retried under the
/// source's cache policy.
async fn load_tilejson(
    identifier: String,
    url: String,
    options: SourceOptions,
    fetcher: Arc<dyn TileFetcher>,
    resolver: Arc<Resolver>,
    cache: Arc<TileCache>,
    shutdown: CancellationToken,
) {
    let data = match fetch_tilejson(&identifier, &url, &options, fetcher.as_ref(), &shutdown).await
    {
        Some(Ok(data)) => data,
        Some(Err(e)) => {
            error!(source = %identifier, url = %url, error = %e, "Unable to fetch TileJSON");
            resolver.unreachable(e);
            return;
        }
        None => return,
    };

    let base = Url::parse(&url).ok();
    let resolved = TileJson::from(&data, base.as_ref())
        .and_then(|document| ResolvedSource::from_tilejson(&document, &options));

    match resolved {
        Ok(resolved) => {
            let replay = resolver.complete(resolved);
            info!(source = %identifier, replay = replay.is_some(), "Resolved source");
            if let (Some(resolved), Some(viewport)) = (resolver.resolved(), replay) {
                if !shutdown.is_cancelled() {
                    cache.restore_viewport(&resolved, viewport);
                }
            }
        }
        Err(e) => {
            error!(source = %identifier, url = %url, error = %e, "Unable to resolve source");
            resolver.fail(match e {
                Error::Configuration(reason) => reason,
                other => other.to_string(),
            });
        }
    }
}

/// Returns `None` once `shutdown` fires.
async fn fetch_tilejson(
    identifier: &str,
    url: &str,
    options: &SourceOptions,
    fetcher: &dyn TileFetcher,
    shutdown: &CancellationToken,
) -> Option<Result<Vec<u8>, FetchError>> {
    let policy = &options.cache;
    let mut failures = 0u32;
    loop {
        debug!(source = %identifier, url = %url, attempt = failures + 1, "Loading TileJSON");
        let fetched = tokio::select! {
            _ = shutdown.cancelled() => return None,
            fetched = fetcher.fetch(url) => fetched,
        };
        match fetched {
            Ok(data) => return Some(Ok(data)),
            Err(e) => {
                failures += 1;
                if failures >= policy.max_fetch_attempts {
                    return Some(Err(e));
                }
                let delay = policy.retry_backoff(failures);
                warn!(
                    source = %identifier,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "TileJSON fetch failed, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use prost::Message;

    use super::*;
    use crate::mvt::proto;
    use crate::mvt::tests::line_feature;

    struct MapFetcher(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl TileFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.0.get(url).cloned().ok_or_else(|| FetchError::Status {
                url: url.to_owned(),
                status: 500,
            })
        }
    }

    fn roads_tile() -> Vec<u8> {
        proto::Tile {
            layers: vec![proto::Layer {
                name: "roads".to_owned(),
                features: vec![line_feature(1, vec![], &[(10, 10), (20, 20)])],
                keys: vec![],
                values: vec![],
                extent: Some(4096),
                version: 2,
            }],
        }
        .encode_to_vec()
    }

    fn options() -> SourceOptions {
        SourceOptions {
            minimum_zoom_level: 9,
            maximum_zoom_level: 16,
            ..SourceOptions::default()
        }
    }

    #[test]
    fn test_constructors_validate_templates() {
        let source = VectorTileSource::with_tile_url_templates(
            "roads",
            vec!["https://ex.com/{z}/{x}/{y}.mvt".to_owned()],
            options(),
        )
        .expect("source");
        assert_eq!("roads", source.identifier());
        assert_eq!((9, 16), source.zoom_range());
        assert!(!source.is_attached());

        let error = VectorTileSource::with_tile_url_templates("roads", vec![], options())
            .err()
            .expect("empty templates must fail");
        assert!(error.is_configuration());

        let error = VectorTileSource::with_tile_url_templates(
            "roads",
            vec!["https://ex.com/tiles.mvt".to_owned()],
            options(),
        )
        .err()
        .expect("templates without placeholders must fail");
        assert!(error.is_configuration());
    }

    #[test]
    fn test_requires_attachment_for_viewports() {
        let source = VectorTileSource::with_tile_url_templates(
            "roads",
            vec!["https://ex.com/{z}/{x}/{y}.mvt".to_owned()],
            options(),
        )
        .expect("source");
        let viewport = Viewport::single(TileCoordinate::new(10, 5, 5));
        assert!(matches!(
            source.update_viewport(viewport),
            Err(Error::NotAttached(_))
        ));
        assert!(source
            .features_in_source_layers(["roads"], None)
            .expect("query")
            .is_empty());
    }

    #[tokio::test]
    async fn test_load_tile_and_detach() {
        let mut tiles = HashMap::new();
        tiles.insert("https://ex.com/10/5/5.mvt".to_owned(), roads_tile());
        let source = VectorTileSource::with_tile_url_templates(
            "roads",
            vec!["https://ex.com/{z}/{x}/{y}.mvt".to_owned()],
            options(),
        )
        .expect("source");
        source.attach(Arc::new(MapFetcher(tiles)), Handle::current());

        let coordinate = TileCoordinate::new(10, 5, 5);
        let tile = source.load_tile(coordinate).await.expect("tile");
        assert_eq!(1, tile.feature_count());
        assert_eq!(TileStatus::Resident, source.tile_status(&coordinate));
        assert_eq!(vec!["roads".to_owned()], source.source_layers());

        assert!(matches!(
            source.load_tile(TileCoordinate::new(2, 4, 0)).await,
            Err(Error::InvalidTile(_))
        ));

        source.detach();
        assert!(!source.is_attached());
        assert_eq!(TileStatus::Unrequested, source.tile_status(&coordinate));
        assert!(source.resident_tiles().is_empty());
    }

    #[tokio::test]
    async fn test_load_tile_clamps_to_zoom_range() {
        let mut tiles = HashMap::new();
        tiles.insert("https://ex.com/2/1/1.mvt".to_owned(), roads_tile());
        tiles.insert("https://ex.com/16/25/50.mvt".to_owned(), roads_tile());
        let source = VectorTileSource::with_tile_url_templates(
            "roads",
            vec!["https://ex.com/{z}/{x}/{y}.mvt".to_owned()],
            options(),
        )
        .expect("source");
        source.attach(Arc::new(MapFetcher(tiles)), Handle::current());

        let below = TileCoordinate::new(2, 1, 1);
        assert!(matches!(
            source.load_tile(below).await,
            Err(Error::InvalidTile(coordinate)) if coordinate == below
        ));
        assert_eq!(TileStatus::Unrequested, source.tile_status(&below));
        assert!(source.resident_tiles().is_empty());

        let tile = source
            .load_tile(TileCoordinate::new(18, 100, 200))
            .await
            .expect("overzoomed tile");
        assert_eq!(1, tile.feature_count());
        assert_eq!(vec![TileCoordinate::new(16, 25, 50)], source.resident_tiles());
    }

    #[tokio::test]
    async fn test_load_tile_outside_bounds_does_not_exist() {
        let mut tiles = HashMap::new();
        tiles.insert("https://ex.com/10/5/5.mvt".to_owned(), roads_tile());
        let source = VectorTileSource::with_tile_url_templates(
            "roads",
            vec!["https://ex.com/{z}/{x}/{y}.mvt".to_owned()],
            SourceOptions {
                coordinate_bounds: Some([0.0, 0.0, 90.0, 70.0]),
                ..options()
            },
        )
        .expect("source");
        source.attach(Arc::new(MapFetcher(tiles)), Handle::current());

        let outside = TileCoordinate::new(10, 5, 5);
        assert!(matches!(
            source.load_tile(outside).await,
            Err(Error::InvalidTile(_))
        ));
        assert_eq!(TileStatus::Unrequested, source.tile_status(&outside));
    }
}
