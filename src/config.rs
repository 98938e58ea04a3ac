/// Source configuration.
///
/// Options may be built in code or read from YAML, using the same keys a
/// style would carry for a vector source:
///
/// ```yaml
/// minimum_zoom_level: 9
/// maximum_zoom_level: 16
/// tile_coordinate_system: tms
/// attribution_infos:
///   - title: "© OpenStreetMap contributors"
///     url: "https://www.openstreetmap.org/copyright"
/// cache:
///   max_fetch_attempts: 5
/// ```
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::coord::{LngLatBounds, MAX_ZOOM};
use crate::error::Error;
use crate::mvt::DEFAULT_EXTENT;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TileCoordinateSystem {
    #[default]
    Xyz,
    Tms,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AttributionInfo {
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// How many tiles stay resident around the viewport and how failed fetches
/// are retried.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CachePolicy {
    /// Rings of tiles kept around the visible ones.
    pub margin: u32,
    /// Zoom levels above and below the current one that stay resident.
    pub neighbor_zoom_levels: u8,
    pub max_fetch_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            margin: 1,
            neighbor_zoom_levels: 1,
            max_fetch_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl CachePolicy {
    /// Delay before retry number `failures` (1-based): exponential in the
    /// number of failures so far, capped at the maximum delay.
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceOptions {
    pub minimum_zoom_level: u8,
    pub maximum_zoom_level: u8,
    /// `[west, south, east, north]`; tiles wholly outside are never requested.
    pub coordinate_bounds: Option<[f64; 4]>,
    pub attribution_infos: Vec<AttributionInfo>,
    pub attribution_html: Option<String>,
    pub tile_coordinate_system: TileCoordinateSystem,
    /// Extent assumed for tile layers that do not declare their own.
    pub extent: u32,
    pub cache: CachePolicy,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            minimum_zoom_level: 0,
            maximum_zoom_level: 22,
            coordinate_bounds: None,
            attribution_infos: Vec::new(),
            attribution_html: None,
            tile_coordinate_system: TileCoordinateSystem::Xyz,
            extent: DEFAULT_EXTENT,
            cache: CachePolicy::default(),
        }
    }
}

impl SourceOptions {
    /// Reads options from a YAML document.
    pub fn from_yaml(data: &str) -> Result<SourceOptions, Error> {
        let options: SourceOptions = serde_yaml::from_str(data)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.minimum_zoom_level > self.maximum_zoom_level {
            return Err(Error::Configuration(format!(
                "minimum zoom level {} exceeds maximum zoom level {}",
                self.minimum_zoom_level, self.maximum_zoom_level
            )));
        }
        if self.maximum_zoom_level > MAX_ZOOM {
            return Err(Error::Configuration(format!(
                "maximum zoom level {} exceeds {}",
                self.maximum_zoom_level, MAX_ZOOM
            )));
        }
        if self.extent == 0 {
            return Err(Error::Configuration("tile extent must be positive".to_owned()));
        }
        if self.cache.max_fetch_attempts == 0 {
            return Err(Error::Configuration(
                "at least one fetch attempt is required".to_owned(),
            ));
        }
        if let Some(bounds) = self.bounds() {
            if !bounds.is_valid() {
                return Err(Error::Configuration(format!(
                    "invalid coordinate bounds {:?}",
                    self.coordinate_bounds
                )));
            }
        }
        Ok(())
    }

    pub fn bounds(&self) -> Option<LngLatBounds> {
        self.coordinate_bounds.map(LngLatBounds::from_array)
    }
}

/// Where a source finds its tiles.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceLocation {
    /// A TileJSON document.
    ConfigurationUrl(Url),
    /// A TileJSON document whose address is kept verbatim, for schemes such
    /// as `pmtiles://https://` that URL parsers mangle.
    ConfigurationUrlString(String),
    /// Explicit tile URL templates.
    Templates(Vec<String>),
}

/// Everything a source was constructed with. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceConfig {
    pub identifier: String,
    pub location: SourceLocation,
    pub options: SourceOptions,
}

impl SourceConfig {
    pub fn new(
        identifier: &str,
        location: SourceLocation,
        options: SourceOptions,
    ) -> Result<SourceConfig, Error> {
        if identifier.is_empty() {
            return Err(Error::Configuration(
                "source identifier must not be empty".to_owned(),
            ));
        }
        match &location {
            SourceLocation::Templates(templates) => {
                match templates.first() {
                    Some(first) if !first.trim().is_empty() => {}
                    _ => {
                        return Err(Error::Configuration(format!(
                            "source {} has no tile URL template",
                            identifier
                        )))
                    }
                }
            }
            SourceLocation::ConfigurationUrlString(url) if url.trim().is_empty() => {
                return Err(Error::Configuration(format!(
                    "source {} has an empty configuration URL",
                    identifier
                )));
            }
            _ => {}
        }
        options.validate()?;

        Ok(SourceConfig {
            identifier: identifier.to_owned(),
            location,
            options,
        })
    }
}
