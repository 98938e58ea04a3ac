use crate::coord::TileCoordinate;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid source configuration: {0}")]
    Configuration(String),
    #[error("Invalid YAML in source options.")]
    Options(#[from] serde_yaml::Error),
    #[error("Invalid TileJSON document: {0}")]
    TileJson(#[from] serde_json::Error),
    #[error("At least one source layer identifier is required.")]
    InvalidLayer,
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error("Source {0} is not attached to a map view.")]
    NotAttached(String),
    #[error("Tile {0} does not exist.")]
    InvalidTile(TileCoordinate),
}

impl Error {
    /// True for every failure that makes a source unusable as configured.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::Options(_) | Error::TileJson(_)
        )
    }
}

/// Outcome of a single tile load. This is cloned out to every caller that
/// joined the same in-flight fetch, hence the owned string payloads.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TileError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Tile request was cancelled.")]
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("Unable to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("Unsupported URL scheme in {0}")]
    UnsupportedScheme(String),
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed vector tile: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("Unable to inflate gzip payload: {0}")]
    Gzip(String),
    #[error("Bad geometry in layer {layer}: {reason}")]
    Geometry { layer: String, reason: String },
    #[error("Bad attributes in layer {layer}: {reason}")]
    Attribute { layer: String, reason: String },
    #[error("Coordinate ({x}, {y}) in layer {layer} lies outside extent {extent}")]
    ExtentViolation {
        layer: String,
        x: i64,
        y: i64,
        extent: u32,
    },
    #[error("Layer name {0} appears more than once")]
    DuplicateLayer(String),
    #[error("Layer {layer} uses unsupported version {version}")]
    UnsupportedVersion { layer: String, version: u32 },
}
