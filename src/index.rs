/// Per source-layer index over the resident tiles.
///
/// The index only records which resident tiles carry which layers; the
/// tiles themselves stay owned by the cache. Entries are added when a tile
/// is admitted and dropped in the same critical section that evicts it.
use std::collections::{BTreeSet, HashMap};

use crate::coord::TileCoordinate;
use crate::feature::{DecodedTile, Feature};
use crate::filter::Filter;

/// A feature returned from a query, tagged with where it came from.
/// Features crossing tile boundaries are returned once per tile.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedFeature {
    pub tile: TileCoordinate,
    pub source_layer: String,
    pub feature: Feature,
}

#[derive(Debug, Default)]
pub struct FeatureIndex {
    layers: HashMap<String, BTreeSet<TileCoordinate>>,
}

impl FeatureIndex {
    pub fn insert(&mut self, tile: &DecodedTile) {
        for name in tile.layers.keys() {
            self.layers
                .entry(name.clone())
                .or_default()
                .insert(tile.coordinate);
        }
    }

    pub fn remove(&mut self, tile: &DecodedTile) {
        for name in tile.layers.keys() {
            if let Some(tiles) = self.layers.get_mut(name) {
                tiles.remove(&tile.coordinate);
                if tiles.is_empty() {
                    self.layers.remove(name);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Source layers present in at least one resident tile.
    pub fn layer_names(&self) -> BTreeSet<&str> {
        self.layers.keys().map(String::as_str).collect()
    }

    /// Collects the features of `layers` that satisfy `filter`, reading tile
    /// contents through `lookup`. Within one tile layer the wire order is
    /// preserved.
    pub fn query<'a, F>(
        &self,
        layers: &BTreeSet<String>,
        filter: Option<&Filter>,
        lookup: F,
    ) -> Vec<LoadedFeature>
    where
        F: Fn(&TileCoordinate) -> Option<&'a DecodedTile>,
    {
        let mut results = Vec::new();
        for name in layers {
            let tiles = match self.layers.get(name) {
                Some(tiles) => tiles,
                None => continue,
            };
            for coordinate in tiles {
                let layer = match lookup(coordinate).and_then(|tile| tile.layer(name)) {
                    Some(layer) => layer,
                    None => continue,
                };
                results.extend(
                    layer
                        .features
                        .iter()
                        .filter(|feature| filter.map_or(true, |f| f.evaluate(feature)))
                        .map(|feature| LoadedFeature {
                            tile: *coordinate,
                            source_layer: name.clone(),
                            feature: feature.clone(),
                        }),
                );
            }
        }
        results
    }
}
