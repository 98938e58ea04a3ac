//! # Tile Scryer
//!
//! A tile-backed vector feature store: loads Mapbox Vector Tiles for the
//! viewport a map is showing, keeps them resident while they are in view, and
//! answers feature queries against whatever is currently loaded.
//!
//! ## Current status
//!
//! This crate should be regarded as stable in terms of code reliability/correctness, but not
//! yet stable in terms of trait and method signatures. We are releasing this code in Rust
//! tradition as 0.x until we feel the interface and feature set have stabilized.
//!
//! ## Current features
//!
//! Given a TileJSON URL or a list of tile URL templates, a [`VectorTileSource`] will fetch,
//! decode and index the tiles covering each viewport it is given, and answer
//! [`VectorTileSource::features_in_source_layers`] queries with optional attribute filters.
//! Concurrent requests for the same tile share one fetch, and tiles are released as soon as
//! they leave the viewport's retention window.
//!
//! ## Known Limitations
//!
//! Queries only see resident tiles: a query never triggers a fetch, so features may lag
//! behind the viewport. Features are reported in tile-local coordinates, and features
//! spanning tile boundaries are returned once per tile they appear in. Only the first tile
//! URL template of a source is used.
//!
//! Bytes are obtained through the [`TileFetcher`] trait, so other transports (archives,
//! offline packs, etc.) can be plugged in without changes to the store itself.

#![deny(warnings)]

// TODO: remove once async fn in dyn-compatible traits become stable
use async_trait::async_trait;

use crate::error::FetchError;

/// Supplies raw tile and TileJSON bytes. This is the only I/O the store
/// performs, and it always happens off the caller's thread.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    /// Fetches the resource at `url`. An empty body is a valid answer and
    /// decodes to a tile without layers.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub mod cache;
pub mod config;
pub mod coord;
pub mod error;
pub mod feature;
pub mod fetch;
pub mod filter;
pub mod index;
pub mod mvt;
pub mod resolver;
pub mod source;
pub mod tilejson;

pub use crate::cache::TileStatus;
pub use crate::config::{SourceConfig, SourceLocation, SourceOptions};
pub use crate::coord::{TileCoordinate, Viewport};
pub use crate::error::Error;
pub use crate::fetch::HttpFetcher;
pub use crate::filter::Filter;
pub use crate::index::LoadedFeature;
pub use crate::source::VectorTileSource;
