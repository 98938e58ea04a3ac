/// Tile addressing and viewport math for the Web Mercator tile pyramid.
use std::collections::BTreeSet;
use std::fmt;

use slippy_map_tilenames::{lonlat2tile, tile2lonlat};

/// Highest zoom level a tile pyramid may declare.
pub const MAX_ZOOM: u8 = 30;

/// Latitude limit of the Web Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

const EARTH_CIRCUMFERENCE_M: f64 = 40_075_016.685_578_49;

/// A single tile in XYZ addressing. Ordered by zoom, then column, then row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoordinate {
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
}

impl TileCoordinate {
    pub fn new(zoom: u8, column: u32, row: u32) -> TileCoordinate {
        TileCoordinate { zoom, column, row }
    }

    /// Whether the column and row exist at this zoom level.
    pub fn is_valid(&self) -> bool {
        self.zoom <= MAX_ZOOM && self.column < dimension(self.zoom) && self.row < dimension(self.zoom)
    }

    pub fn parent(&self) -> Option<TileCoordinate> {
        if self.zoom == 0 {
            return None;
        }
        Some(TileCoordinate::new(self.zoom - 1, self.column >> 1, self.row >> 1))
    }

    /// Row number in the TMS scheme, where row 0 is the southernmost.
    pub fn tms_row(&self) -> u32 {
        dimension(self.zoom) - 1 - self.row
    }

    /// Bing-style quadkey; empty at zoom 0.
    pub fn quadkey(&self) -> String {
        (1..=self.zoom)
            .rev()
            .map(|level| {
                let mask = 1u32 << (level - 1);
                let mut digit = 0u8;
                if self.column & mask != 0 {
                    digit += 1;
                }
                if self.row & mask != 0 {
                    digit += 2;
                }
                char::from(b'0' + digit)
            })
            .collect()
    }

    /// Geographic extent of the tile.
    pub fn lng_lat_bounds(&self) -> LngLatBounds {
        let (west, north) = tile2lonlat(self.column, self.row, self.zoom);
        let (east, south) = tile2lonlat(self.column + 1, self.row + 1, self.zoom);
        LngLatBounds {
            west,
            south,
            east,
            north,
        }
    }

    /// Extent of the tile in EPSG:3857 meters.
    pub fn epsg_3857_bounds(&self) -> TileBounds {
        let size = EARTH_CIRCUMFERENCE_M / f64::from(dimension(self.zoom));
        let origin = EARTH_CIRCUMFERENCE_M / 2.0;
        TileBounds {
            west: f64::from(self.column) * size - origin,
            east: f64::from(self.column + 1) * size - origin,
            north: origin - f64::from(self.row) * size,
            south: origin - f64::from(self.row + 1) * size,
        }
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.column, self.row)
    }
}

/// Number of tiles along one axis at `zoom`.
pub fn dimension(zoom: u8) -> u32 {
    1u32 << zoom.min(31)
}

/// Projected tile extent in meters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

/// Geographic extent in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LngLatBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl LngLatBounds {
    /// Builds bounds from a `[west, south, east, north]` array as used by TileJSON.
    pub fn from_array(bounds: [f64; 4]) -> LngLatBounds {
        LngLatBounds {
            west: bounds[0],
            south: bounds[1],
            east: bounds[2],
            north: bounds[3],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.west <= self.east
            && self.south <= self.north
            && (-180.0..=180.0).contains(&self.west)
            && (-180.0..=180.0).contains(&self.east)
            && (-90.0..=90.0).contains(&self.south)
            && (-90.0..=90.0).contains(&self.north)
    }

    pub fn intersects(&self, other: &LngLatBounds) -> bool {
        self.west < other.east
            && other.west < self.east
            && self.south < other.north
            && other.south < self.north
    }
}

/// The block of tiles a map view currently shows at one zoom level.
/// Ranges are inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub zoom: u8,
    pub min_column: u32,
    pub max_column: u32,
    pub min_row: u32,
    pub max_row: u32,
}

impl Viewport {
    /// Creates a viewport, swapping reversed ranges and clamping them to the
    /// tiles that exist at `zoom`.
    pub fn new(zoom: u8, columns: (u32, u32), rows: (u32, u32)) -> Viewport {
        let zoom = zoom.min(MAX_ZOOM);
        let last = dimension(zoom) - 1;
        Viewport {
            zoom,
            min_column: columns.0.min(columns.1).min(last),
            max_column: columns.0.max(columns.1).min(last),
            min_row: rows.0.min(rows.1).min(last),
            max_row: rows.0.max(rows.1).min(last),
        }
    }

    /// A viewport showing exactly one tile.
    pub fn single(tile: TileCoordinate) -> Viewport {
        Viewport::new(tile.zoom, (tile.column, tile.column), (tile.row, tile.row))
    }

    /// The tiles covering a geographic bounding box at `zoom`.
    pub fn from_lng_lat_bounds(bounds: LngLatBounds, zoom: u8) -> Viewport {
        let zoom = zoom.min(MAX_ZOOM);
        let (west, north) = lonlat2tile(
            bounds.west.clamp(-180.0, 180.0),
            bounds.north.clamp(-MAX_LATITUDE, MAX_LATITUDE),
            zoom,
        );
        let (east, south) = lonlat2tile(
            bounds.east.clamp(-180.0, 180.0),
            bounds.south.clamp(-MAX_LATITUDE, MAX_LATITUDE),
            zoom,
        );
        Viewport::new(zoom, (west, east), (north, south))
    }

    pub fn contains(&self, tile: &TileCoordinate) -> bool {
        tile.zoom == self.zoom
            && (self.min_column..=self.max_column).contains(&tile.column)
            && (self.min_row..=self.max_row).contains(&tile.row)
    }

    pub fn tile_count(&self) -> u64 {
        u64::from(self.max_column - self.min_column + 1) * u64::from(self.max_row - self.min_row + 1)
    }

    /// Grows the range by `margin` tiles on every side. Tiles do not wrap
    /// around the antimeridian.
    pub fn expand(&self, margin: u32) -> Viewport {
        let last = dimension(self.zoom) - 1;
        Viewport {
            zoom: self.zoom,
            min_column: self.min_column.saturating_sub(margin),
            max_column: self.max_column.saturating_add(margin).min(last),
            min_row: self.min_row.saturating_sub(margin),
            max_row: self.max_row.saturating_add(margin).min(last),
        }
    }

    /// The same area expressed in tiles of another zoom level.
    pub fn at_zoom(&self, zoom: u8) -> Viewport {
        let zoom = zoom.min(MAX_ZOOM);
        if zoom <= self.zoom {
            let shift = u32::from(self.zoom - zoom);
            Viewport {
                zoom,
                min_column: self.min_column >> shift,
                max_column: self.max_column >> shift,
                min_row: self.min_row >> shift,
                max_row: self.max_row >> shift,
            }
        } else {
            let shift = u32::from(zoom - self.zoom);
            let fill = (1u32 << shift) - 1;
            Viewport {
                zoom,
                min_column: self.min_column << shift,
                max_column: (self.max_column << shift) | fill,
                min_row: self.min_row << shift,
                max_row: (self.max_row << shift) | fill,
            }
        }
    }

    pub fn coordinates(&self) -> impl Iterator<Item = TileCoordinate> + '_ {
        (self.min_column..=self.max_column).flat_map(move |column| {
            (self.min_row..=self.max_row).map(move |row| TileCoordinate::new(self.zoom, column, row))
        })
    }

    /// The zoom level a source with the given range would load for this
    /// viewport. Views above the maximum overzoom the deepest tiles; views
    /// below the minimum load nothing.
    pub fn source_zoom(&self, min_zoom: u8, max_zoom: u8) -> Option<u8> {
        if self.zoom < min_zoom {
            None
        } else {
            Some(self.zoom.min(max_zoom))
        }
    }

    /// Tiles a source must load to draw this viewport.
    pub fn covering_tiles(&self, min_zoom: u8, max_zoom: u8) -> Vec<TileCoordinate> {
        match self.source_zoom(min_zoom, max_zoom) {
            Some(zoom) => self.at_zoom(zoom).coordinates().collect(),
            None => Vec::new(),
        }
    }

    /// Tiles a source keeps resident for this viewport: the covering tiles
    /// plus `margin` rings, and optionally the same ringed area one zoom
    /// level up and down.
    pub fn retention_window(
        &self,
        min_zoom: u8,
        max_zoom: u8,
        margin: u32,
        neighbor_zoom_levels: u8,
    ) -> BTreeSet<TileCoordinate> {
        let mut window = BTreeSet::new();
        let zoom = match self.source_zoom(min_zoom, max_zoom) {
            Some(zoom) => zoom,
            None => return window,
        };
        let ringed = self.at_zoom(zoom).expand(margin);
        window.extend(ringed.coordinates());

        for delta in 1..=neighbor_zoom_levels {
            if let Some(parent_zoom) = zoom.checked_sub(delta).filter(|z| *z >= min_zoom) {
                window.extend(ringed.at_zoom(parent_zoom).coordinates());
            }
            let child_zoom = zoom.saturating_add(delta);
            if child_zoom <= max_zoom && child_zoom <= MAX_ZOOM && child_zoom != zoom {
                window.extend(ringed.at_zoom(child_zoom).coordinates());
            }
        }
        window
    }
}
