/// Decoded vector tile content.
use std::collections::BTreeMap;
use std::fmt;

use crate::coord::TileCoordinate;

/// A vertex in tile-local integer coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TilePoint {
    pub x: i32,
    pub y: i32,
}

impl TilePoint {
    pub fn new(x: i32, y: i32) -> TilePoint {
        TilePoint { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
}

impl GeometryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryType::Point => "Point",
            GeometryType::LineString => "LineString",
            GeometryType::Polygon => "Polygon",
        }
    }
}

/// Feature geometry. Every variant is the "multi" form; a plain point or line
/// is simply a collection of one.
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Point(Vec<TilePoint>),
    LineString(Vec<Vec<TilePoint>>),
    /// Polygons, each an exterior ring followed by its holes.
    Polygon(Vec<Vec<Vec<TilePoint>>>),
}

impl Geometry {
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::LineString(_) => GeometryType::LineString,
            Geometry::Polygon(_) => GeometryType::Polygon,
        }
    }

    pub fn points(&self) -> Box<dyn Iterator<Item = &TilePoint> + '_> {
        match self {
            Geometry::Point(points) => Box::new(points.iter()),
            Geometry::LineString(lines) => Box::new(lines.iter().flatten()),
            Geometry::Polygon(polygons) => Box::new(polygons.iter().flatten().flatten()),
        }
    }
}

/// An attribute value. Integers keep their wire width so identifiers
/// round-trip exactly.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        self.as_f64().is_some()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Value {
        Value::Double(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub id: Option<u64>,
    pub geometry: Geometry,
    pub properties: BTreeMap<String, Value>,
}

impl Feature {
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// One named layer of a decoded tile, features in wire order.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub name: String,
    pub version: u32,
    pub extent: u32,
    pub features: Vec<Feature>,
}

/// A fully decoded and validated tile.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedTile {
    pub coordinate: TileCoordinate,
    pub layers: BTreeMap<String, Layer>,
}

impl DecodedTile {
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn feature_count(&self) -> usize {
        self.layers.values().map(|layer| layer.features.len()).sum()
    }
}
