/// Mapbox Vector Tile decoding.
///
/// Further reading: https://github.com/mapbox/vector-tile-spec/tree/master/2.1
use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use prost::Message;
use tracing::trace;

use crate::coord::TileCoordinate;
use crate::error::DecodeError;
use crate::feature::{DecodedTile, Feature, Geometry, Layer, TilePoint, Value};

/// Extent assumed for layers that do not declare one.
pub const DEFAULT_EXTENT: u32 = 4096;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const MOVE_TO: u32 = 1;
const LINE_TO: u32 = 2;
const CLOSE_PATH: u32 = 7;

/// Wire types for `vector_tile.proto`, version 2.1.
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Tile {
        #[prost(message, repeated, tag = "3")]
        pub layers: Vec<Layer>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Layer {
        #[prost(string, required, tag = "1")]
        pub name: String,
        #[prost(message, repeated, tag = "2")]
        pub features: Vec<Feature>,
        #[prost(string, repeated, tag = "3")]
        pub keys: Vec<String>,
        #[prost(message, repeated, tag = "4")]
        pub values: Vec<Value>,
        #[prost(uint32, optional, tag = "5")]
        pub extent: Option<u32>,
        #[prost(uint32, required, tag = "15", default = "1")]
        pub version: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Feature {
        #[prost(uint64, optional, tag = "1")]
        pub id: Option<u64>,
        #[prost(uint32, repeated, packed = "true", tag = "2")]
        pub tags: Vec<u32>,
        #[prost(enumeration = "GeomType", optional, tag = "3")]
        pub r#type: Option<i32>,
        #[prost(uint32, repeated, packed = "true", tag = "4")]
        pub geometry: Vec<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Value {
        #[prost(string, optional, tag = "1")]
        pub string_value: Option<String>,
        #[prost(float, optional, tag = "2")]
        pub float_value: Option<f32>,
        #[prost(double, optional, tag = "3")]
        pub double_value: Option<f64>,
        #[prost(int64, optional, tag = "4")]
        pub int_value: Option<i64>,
        #[prost(uint64, optional, tag = "5")]
        pub uint_value: Option<u64>,
        #[prost(sint64, optional, tag = "6")]
        pub sint_value: Option<i64>,
        #[prost(bool, optional, tag = "7")]
        pub bool_value: Option<bool>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum GeomType {
        Unknown = 0,
        Point = 1,
        Linestring = 2,
        Polygon = 3,
    }
}

/// Decodes and validates a tile payload. Gzip-compressed payloads are
/// inflated first. Any malformed layer or out-of-range coordinate rejects
/// the whole tile.
pub fn decode_tile(
    coordinate: TileCoordinate,
    payload: &[u8],
    default_extent: u32,
) -> Result<DecodedTile, DecodeError> {
    let inflated;
    let bytes = if payload.starts_with(&GZIP_MAGIC) {
        inflated = inflate(payload)?;
        inflated.as_slice()
    } else {
        payload
    };

    let tile = proto::Tile::decode(bytes)?;
    let mut layers = BTreeMap::new();
    for raw in tile.layers {
        let layer = decode_layer(raw, default_extent)?;
        if layers.contains_key(&layer.name) {
            return Err(DecodeError::DuplicateLayer(layer.name));
        }
        layers.insert(layer.name.clone(), layer);
    }

    Ok(DecodedTile { coordinate, layers })
}

fn inflate(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut data = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut data)
        .map_err(|e| DecodeError::Gzip(e.to_string()))?;
    Ok(data)
}

fn decode_layer(raw: proto::Layer, default_extent: u32) -> Result<Layer, DecodeError> {
    if raw.version != 1 && raw.version != 2 {
        return Err(DecodeError::UnsupportedVersion {
            layer: raw.name,
            version: raw.version,
        });
    }
    let extent = raw.extent.unwrap_or(default_extent);
    if extent == 0 {
        return Err(DecodeError::Geometry {
            layer: raw.name,
            reason: "layer extent is zero".to_owned(),
        });
    }

    let values: Vec<Value> = raw.values.iter().map(convert_value).collect();
    let mut features = Vec::with_capacity(raw.features.len());
    for feature in &raw.features {
        let kind = feature
            .r#type
            .and_then(|t| proto::GeomType::try_from(t).ok())
            .unwrap_or(proto::GeomType::Unknown);
        if kind == proto::GeomType::Unknown {
            trace!(layer = %raw.name, id = ?feature.id, "Skipping feature of unknown geometry type");
            continue;
        }

        let properties = decode_properties(&raw.name, &raw.keys, &values, &feature.tags)?;
        let geometry = decode_geometry(&raw.name, kind, &feature.geometry, extent)?;
        features.push(Feature {
            id: feature.id,
            geometry,
            properties,
        });
    }

    Ok(Layer {
        name: raw.name,
        version: raw.version,
        extent,
        features,
    })
}

fn convert_value(value: &proto::Value) -> Value {
    if let Some(v) = &value.string_value {
        Value::String(v.clone())
    } else if let Some(v) = value.float_value {
        Value::Double(f64::from(v))
    } else if let Some(v) = value.double_value {
        Value::Double(v)
    } else if let Some(v) = value.int_value {
        Value::Int(v)
    } else if let Some(v) = value.uint_value {
        Value::UInt(v)
    } else if let Some(v) = value.sint_value {
        Value::Int(v)
    } else if let Some(v) = value.bool_value {
        Value::Bool(v)
    } else {
        Value::Null
    }
}

fn decode_properties(
    layer: &str,
    keys: &[String],
    values: &[Value],
    tags: &[u32],
) -> Result<BTreeMap<String, Value>, DecodeError> {
    if tags.len() % 2 != 0 {
        return Err(DecodeError::Attribute {
            layer: layer.to_owned(),
            reason: format!("odd number of tags ({})", tags.len()),
        });
    }

    let mut properties = BTreeMap::new();
    for pair in tags.chunks_exact(2) {
        let key = keys.get(pair[0] as usize).ok_or_else(|| DecodeError::Attribute {
            layer: layer.to_owned(),
            reason: format!("key index {} out of range", pair[0]),
        })?;
        let value = values.get(pair[1] as usize).ok_or_else(|| DecodeError::Attribute {
            layer: layer.to_owned(),
            reason: format!("value index {} out of range", pair[1]),
        })?;
        properties.insert(key.clone(), value.clone());
    }
    Ok(properties)
}

fn decode_zigzag(value: u32) -> i64 {
    i64::from((value >> 1) as i32 ^ -((value & 1) as i32))
}

/// Runs the geometry command stream, checking every vertex against the
/// `[-extent, 2 * extent - 1]` window.
fn decode_paths(
    layer: &str,
    kind: proto::GeomType,
    commands: &[u32],
    extent: u32,
) -> Result<Vec<Vec<TilePoint>>, DecodeError> {
    let bad = |reason: String| DecodeError::Geometry {
        layer: layer.to_owned(),
        reason,
    };
    let min = -i64::from(extent);
    let max = 2 * i64::from(extent) - 1;

    let mut paths: Vec<Vec<TilePoint>> = Vec::new();
    let mut path: Vec<TilePoint> = Vec::new();
    let (mut x, mut y) = (0i64, 0i64);
    let mut cursor = 0usize;

    while cursor < commands.len() {
        let command = commands[cursor];
        cursor += 1;
        let id = command & 0x7;
        let count = (command >> 3) as usize;

        match id {
            MOVE_TO | LINE_TO => {
                if count == 0 {
                    return Err(bad(format!("command {} with zero count", id)));
                }
                if id == MOVE_TO && kind != proto::GeomType::Point && count != 1 {
                    return Err(bad(format!("MoveTo with count {}", count)));
                }
                if id == LINE_TO && (kind == proto::GeomType::Point || path.is_empty()) {
                    return Err(bad("LineTo without a preceding MoveTo".to_owned()));
                }
                let end = cursor + 2 * count;
                if end > commands.len() {
                    return Err(bad("truncated command parameters".to_owned()));
                }
                for params in commands[cursor..end].chunks_exact(2) {
                    x += decode_zigzag(params[0]);
                    y += decode_zigzag(params[1]);
                    if x < min || x > max || y < min || y > max {
                        return Err(DecodeError::ExtentViolation {
                            layer: layer.to_owned(),
                            x,
                            y,
                            extent,
                        });
                    }
                    if id == MOVE_TO && kind != proto::GeomType::Point && !path.is_empty() {
                        if kind == proto::GeomType::Polygon {
                            return Err(bad("ring is missing ClosePath".to_owned()));
                        }
                        paths.push(std::mem::take(&mut path));
                    }
                    // Range checked above, so the narrowing cannot truncate.
                    path.push(TilePoint::new(x as i32, y as i32));
                }
                cursor = end;
            }
            CLOSE_PATH => {
                if kind != proto::GeomType::Polygon || count != 1 {
                    return Err(bad("unexpected ClosePath".to_owned()));
                }
                if path.len() < 3 {
                    return Err(bad(format!("ring with {} vertices", path.len())));
                }
                let first = path[0];
                path.push(first);
                paths.push(std::mem::take(&mut path));
            }
            other => return Err(bad(format!("unknown command {}", other))),
        }
    }
    if !path.is_empty() {
        if kind == proto::GeomType::Polygon {
            return Err(bad("ring is missing ClosePath".to_owned()));
        }
        paths.push(path);
    }
    if paths.is_empty() {
        return Err(bad("feature has no geometry".to_owned()));
    }
    Ok(paths)
}

fn decode_geometry(
    layer: &str,
    kind: proto::GeomType,
    commands: &[u32],
    extent: u32,
) -> Result<Geometry, DecodeError> {
    let paths = decode_paths(layer, kind, commands, extent)?;
    match kind {
        proto::GeomType::Point => Ok(Geometry::Point(paths.into_iter().flatten().collect())),
        proto::GeomType::Linestring => {
            if let Some(short) = paths.iter().find(|line| line.len() < 2) {
                return Err(DecodeError::Geometry {
                    layer: layer.to_owned(),
                    reason: format!("line with {} vertices", short.len()),
                });
            }
            Ok(Geometry::LineString(paths))
        }
        _ => Ok(Geometry::Polygon(classify_rings(paths))),
    }
}

/// Twice the signed area of a closed ring in tile space (y pointing down).
fn ring_area(ring: &[TilePoint]) -> i64 {
    ring.windows(2)
        .map(|w| i64::from(w[0].x) * i64::from(w[1].y) - i64::from(w[1].x) * i64::from(w[0].y))
        .sum()
}

/// Groups rings into polygons. Exterior rings wind the same way as the
/// first ring in the feature, which also copes with version 1 tiles that
/// used the opposite convention.
fn classify_rings(rings: Vec<Vec<TilePoint>>) -> Vec<Vec<Vec<TilePoint>>> {
    let mut polygons: Vec<Vec<Vec<TilePoint>>> = Vec::new();
    let mut exterior_sign = 0i64;

    for ring in rings {
        let area = ring_area(&ring);
        if area == 0 {
            continue;
        }
        if exterior_sign == 0 {
            exterior_sign = area.signum();
        }
        match polygons.last_mut() {
            Some(polygon) if area.signum() != exterior_sign => polygon.push(ring),
            _ => polygons.push(vec![ring]),
        }
    }
    polygons
}
