/// Tile URL templates and source resolution.
///
/// Template sources resolve immediately. Sources configured by a TileJSON URL
/// resolve once the document arrives; viewport requests issued before that
/// are queued here and handed back for replay.
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::{AttributionInfo, SourceOptions, TileCoordinateSystem};
use crate::coord::{LngLatBounds, TileCoordinate, Viewport};
use crate::error::{Error, FetchError, TileError};
use crate::tilejson::{TileJson, VectorLayer};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Zoom,
    Column,
    Row,
    TmsRow,
    Quadkey,
    Prefix,
    BboxEpsg3857,
    Ratio,
}

/// A tile URL template, split into literal text and placeholders once so
/// expanding it per tile is cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileUrlTemplate {
    template: String,
    segments: Vec<Segment>,
}

impl TileUrlTemplate {
    pub fn parse(template: &str) -> Result<TileUrlTemplate, Error> {
        let malformed = |reason: &str| {
            Error::Configuration(format!("malformed tile URL template {:?}: {}", template, reason))
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let close = rest[open..]
                .find('}')
                .map(|offset| open + offset)
                .ok_or_else(|| malformed("unterminated placeholder"))?;
            let token = &rest[open + 1..close];
            let segment = match token {
                "z" => Some(Segment::Zoom),
                "x" => Some(Segment::Column),
                "y" => Some(Segment::Row),
                "-y" => Some(Segment::TmsRow),
                "quadkey" => Some(Segment::Quadkey),
                "prefix" => Some(Segment::Prefix),
                "bbox-epsg-3857" => Some(Segment::BboxEpsg3857),
                "ratio" => Some(Segment::Ratio),
                _ => None,
            };
            match segment {
                Some(segment) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                // Unknown tokens pass through untouched.
                None => literal.push_str(&rest[open..=close]),
            }
            rest = &rest[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let addresses_tiles = segments.iter().any(|segment| {
            matches!(
                segment,
                Segment::Zoom | Segment::Quadkey | Segment::BboxEpsg3857
            )
        });
        if !addresses_tiles {
            return Err(malformed("no tile placeholders"));
        }

        Ok(TileUrlTemplate {
            template: template.to_owned(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitutes the placeholders for `tile`. In the TMS scheme `{y}`
    /// counts rows from the south.
    pub fn expand(&self, tile: TileCoordinate, scheme: TileCoordinateSystem) -> String {
        let mut url = String::with_capacity(self.template.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => url.push_str(text),
                Segment::Zoom => url.push_str(&tile.zoom.to_string()),
                Segment::Column => url.push_str(&tile.column.to_string()),
                Segment::Row => {
                    let row = match scheme {
                        TileCoordinateSystem::Xyz => tile.row,
                        TileCoordinateSystem::Tms => tile.tms_row(),
                    };
                    url.push_str(&row.to_string());
                }
                Segment::TmsRow => url.push_str(&tile.tms_row().to_string()),
                Segment::Quadkey => url.push_str(&tile.quadkey()),
                Segment::Prefix => {
                    url.push_str(&format!("{:x}{:x}", tile.column % 16, tile.row % 16))
                }
                Segment::BboxEpsg3857 => {
                    let b = tile.epsg_3857_bounds();
                    url.push_str(&format!("{},{},{},{}", b.west, b.south, b.east, b.north));
                }
                Segment::Ratio => {}
            }
        }
        url
    }
}

/// The effective description of a source once its template is known.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSource {
    pub template: TileUrlTemplate,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub scheme: TileCoordinateSystem,
    pub bounds: Option<LngLatBounds>,
    pub extent: u32,
    pub attribution: Vec<AttributionInfo>,
    pub attribution_html: Option<String>,
    pub vector_layers: Vec<VectorLayer>,
}

impl ResolvedSource {
    /// Resolves explicit templates. Only the first template is honored.
    pub fn from_templates(
        templates: &[String],
        options: &SourceOptions,
    ) -> Result<ResolvedSource, Error> {
        let first = templates
            .first()
            .ok_or_else(|| Error::Configuration("no tile URL template".to_owned()))?;
        Ok(ResolvedSource {
            template: TileUrlTemplate::parse(first)?,
            min_zoom: options.minimum_zoom_level,
            max_zoom: options.maximum_zoom_level,
            scheme: options.tile_coordinate_system,
            bounds: options.bounds(),
            extent: options.extent,
            attribution: options.attribution_infos.clone(),
            attribution_html: options.attribution_html.clone(),
            vector_layers: Vec::new(),
        })
    }

    /// Resolves a fetched TileJSON document. Values in the document take
    /// precedence over the source options.
    pub fn from_tilejson(
        document: &TileJson,
        options: &SourceOptions,
    ) -> Result<ResolvedSource, Error> {
        let template = document.template().ok_or_else(|| {
            Error::Configuration("TileJSON document has no usable tile URL template".to_owned())
        })?;
        let bounds = match document.bounds {
            Some(bounds) => Some(LngLatBounds::from_array(bounds)).filter(LngLatBounds::is_valid),
            None => options.bounds(),
        };
        let min_zoom = document.min_zoom.unwrap_or(options.minimum_zoom_level);
        let max_zoom = document.max_zoom.unwrap_or(options.maximum_zoom_level);
        if min_zoom > max_zoom {
            return Err(Error::Configuration(format!(
                "zoom range {}..{} is empty",
                min_zoom, max_zoom
            )));
        }

        Ok(ResolvedSource {
            template: TileUrlTemplate::parse(template)?,
            min_zoom,
            max_zoom,
            scheme: document.scheme.unwrap_or(options.tile_coordinate_system),
            bounds,
            extent: options.extent,
            attribution: options.attribution_infos.clone(),
            attribution_html: document
                .attribution
                .clone()
                .or_else(|| options.attribution_html.clone()),
            vector_layers: document.vector_layers.clone(),
        })
    }

    pub fn tile_url(&self, tile: TileCoordinate) -> String {
        self.template.expand(tile, self.scheme)
    }

    pub fn covers(&self, tile: &TileCoordinate) -> bool {
        match &self.bounds {
            Some(bounds) => bounds.intersects(&tile.lng_lat_bounds()),
            None => true,
        }
    }

    /// The tile actually fetched for a request of `tile`. Tiles above the
    /// maximum zoom map to their ancestor at the maximum zoom; tiles below the
    /// minimum zoom or outside the bounds have none.
    pub fn source_tile(&self, tile: TileCoordinate) -> Option<TileCoordinate> {
        if tile.zoom < self.min_zoom || !self.covers(&tile) {
            return None;
        }
        if tile.zoom <= self.max_zoom {
            return Some(tile);
        }
        let shift = tile.zoom - self.max_zoom;
        Some(TileCoordinate::new(
            self.max_zoom,
            tile.column >> shift,
            tile.row >> shift,
        ))
    }

    /// Tiles to load for `viewport`, clamped to the source's zoom range and
    /// bounds.
    pub fn covering_tiles(&self, viewport: &Viewport) -> Vec<TileCoordinate> {
        viewport
            .covering_tiles(self.min_zoom, self.max_zoom)
            .into_iter()
            .filter(|tile| self.covers(tile))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Resolution {
    Pending,
    Ready,
    /// The document was fetched but is unusable.
    Invalid(String),
    /// The document could not be fetched. Loading may be tried again.
    Unreachable(FetchError),
}

/// Holds the resolved source once known, and the latest viewport that
/// arrived before it was.
pub struct Resolver {
    resolved: OnceCell<Arc<ResolvedSource>>,
    queued: Mutex<Option<Viewport>>,
    state: watch::Sender<Resolution>,
}

impl Resolver {
    pub fn pending() -> Resolver {
        let (state, _) = watch::channel(Resolution::Pending);
        Resolver {
            resolved: OnceCell::new(),
            queued: Mutex::new(None),
            state,
        }
    }

    pub fn ready(source: ResolvedSource) -> Resolver {
        let resolver = Resolver::pending();
        resolver.complete(source);
        resolver
    }

    pub fn resolved(&self) -> Option<Arc<ResolvedSource>> {
        self.resolved.get().cloned()
    }

    /// Returns the resolved source, or holds on to `viewport` for replay if
    /// the document may still arrive. Only the latest viewport is kept.
    pub fn resolve_or_queue(&self, viewport: Viewport) -> Option<Arc<ResolvedSource>> {
        let mut queued = self.queued.lock();
        match self.resolved.get() {
            Some(resolved) => Some(resolved.clone()),
            None => {
                if matches!(
                    *self.state.borrow(),
                    Resolution::Pending | Resolution::Unreachable(_)
                ) {
                    *queued = Some(viewport);
                }
                None
            }
        }
    }

    /// Publishes the resolved source and hands back the viewport queued so
    /// far, if any.
    pub fn complete(&self, source: ResolvedSource) -> Option<Viewport> {
        let mut queued = self.queued.lock();
        if self.resolved.set(Arc::new(source)).is_err() {
            return None;
        }
        self.state.send_replace(Resolution::Ready);
        queued.take()
    }

    /// Records an unusable document. The queued viewport is discarded and
    /// the failure is permanent.
    pub fn fail(&self, reason: String) {
        let mut queued = self.queued.lock();
        *queued = None;
        if self.resolved.get().is_none() {
            self.state.send_replace(Resolution::Invalid(reason));
        }
    }

    /// Records that the document could not be fetched. The queued viewport
    /// is kept for a later attempt.
    pub fn unreachable(&self, error: FetchError) {
        let _queued = self.queued.lock();
        if self.resolved.get().is_none() {
            self.state.send_replace(Resolution::Unreachable(error));
        }
    }

    /// Whether the document still has to be loaded. An earlier fetch
    /// failure is cleared so loading starts over.
    pub fn reopen(&self) -> bool {
        let _queued = self.queued.lock();
        if self.resolved.get().is_some() {
            return false;
        }
        self.state.send_if_modified(|state| match state {
            Resolution::Unreachable(_) => {
                *state = Resolution::Pending;
                true
            }
            _ => false,
        });
        matches!(*self.state.borrow(), Resolution::Pending)
    }

    pub fn failure(&self) -> Option<Error> {
        failure_error(&self.state.borrow())
    }

    /// Waits until the source is resolved or resolution failed.
    pub async fn wait(&self) -> Result<Arc<ResolvedSource>, Error> {
        let mut state = self.state.subscribe();
        let outcome = state
            .wait_for(|resolution| *resolution != Resolution::Pending)
            .await
            .map(|resolution| resolution.clone())
            .map_err(|_| Error::Configuration("source resolution was abandoned".to_owned()))?;
        if let Some(error) = failure_error(&outcome) {
            return Err(error);
        }
        self.resolved()
            .ok_or_else(|| Error::Configuration("source is not resolved".to_owned()))
    }
}

fn failure_error(resolution: &Resolution) -> Option<Error> {
    match resolution {
        Resolution::Invalid(reason) => Some(Error::Configuration(reason.clone())),
        Resolution::Unreachable(e) => Some(Error::Tile(TileError::Fetch(e.clone()))),
        Resolution::Pending | Resolution::Ready => None,
    }
}
