/// Feature predicates.
///
/// A [`Filter`] is a small boolean expression tree over feature attributes.
/// Map styles hand these over in the legacy JSON filter syntax, e.g.
/// `["all", ["==", "class", "motorway"], ["has", "ref"]]`, which
/// [`Filter::from_json`] understands.
use std::cmp::Ordering;

use serde_json::Value as Json;

use crate::error::Error;
use crate::feature::{Feature, Value};

/// What a comparison reads from a feature.
#[derive(Clone, Debug, PartialEq)]
pub enum Key {
    Property(String),
    /// `$type`: the geometry type name.
    GeometryType,
    /// `$id`: the feature identifier.
    Id,
}

impl Key {
    fn parse(name: &str) -> Key {
        match name {
            "$type" => Key::GeometryType,
            "$id" => Key::Id,
            _ => Key::Property(name.to_owned()),
        }
    }

    fn lookup(&self, feature: &Feature) -> Option<Value> {
        match self {
            Key::Property(name) => feature.property(name).cloned(),
            Key::GeometryType => Some(Value::String(
                feature.geometry.geometry_type().as_str().to_owned(),
            )),
            Key::Id => feature.id.map(Value::UInt),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        key: Key,
        op: Comparison,
        value: Value,
    },
    In {
        key: Key,
        values: Vec<Value>,
    },
    Has(Key),
}

impl Filter {
    pub fn equals(key: &str, value: impl Into<Value>) -> Filter {
        Filter::compare(key, Comparison::Equal, value)
    }

    pub fn compare(key: &str, op: Comparison, value: impl Into<Value>) -> Filter {
        Filter::Compare {
            key: Key::parse(key),
            op,
            value: value.into(),
        }
    }

    pub fn has(key: &str) -> Filter {
        Filter::Has(Key::parse(key))
    }

    pub fn negate(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    pub fn evaluate(&self, feature: &Feature) -> bool {
        match self {
            Filter::All(filters) => filters.iter().all(|f| f.evaluate(feature)),
            Filter::Any(filters) => filters.iter().any(|f| f.evaluate(feature)),
            Filter::Not(filter) => !filter.evaluate(feature),
            Filter::Compare { key, op, value } => match key.lookup(feature) {
                Some(actual) => compare(&actual, *op, value),
                // A missing attribute only satisfies `!=`.
                None => *op == Comparison::NotEqual,
            },
            Filter::In { key, values } => key
                .lookup(feature)
                .map(|actual| values.iter().any(|v| equal(&actual, v)))
                .unwrap_or(false),
            Filter::Has(key) => key.lookup(feature).is_some(),
        }
    }

    /// Parses a legacy style-spec filter expression.
    pub fn from_json(json: &Json) -> Result<Filter, Error> {
        let items = json
            .as_array()
            .ok_or_else(|| invalid(json, "expected an array"))?;
        let (op, args) = items
            .split_first()
            .ok_or_else(|| invalid(json, "empty expression"))?;
        let op = op
            .as_str()
            .ok_or_else(|| invalid(json, "operator must be a string"))?;

        let children = || -> Result<Vec<Filter>, Error> { args.iter().map(Filter::from_json).collect() };
        let key = || -> Result<Key, Error> {
            args.first()
                .and_then(Json::as_str)
                .map(Key::parse)
                .ok_or_else(|| invalid(json, "missing attribute key"))
        };
        let operand = || -> Result<Value, Error> {
            if args.len() != 2 {
                return Err(invalid(json, "comparison takes a key and one value"));
            }
            literal(&args[1]).ok_or_else(|| invalid(json, "value must be a literal"))
        };
        let list = || -> Result<Vec<Value>, Error> {
            args.iter()
                .skip(1)
                .map(|v| literal(v).ok_or_else(|| invalid(json, "value must be a literal")))
                .collect()
        };

        let filter = match op {
            "all" => Filter::All(children()?),
            "any" => Filter::Any(children()?),
            "none" => Filter::Any(children()?).negate(),
            "==" | "!=" | "<" | "<=" | ">" | ">=" => {
                let op = match op {
                    "==" => Comparison::Equal,
                    "!=" => Comparison::NotEqual,
                    "<" => Comparison::Less,
                    "<=" => Comparison::LessOrEqual,
                    ">" => Comparison::Greater,
                    _ => Comparison::GreaterOrEqual,
                };
                Filter::Compare {
                    key: key()?,
                    op,
                    value: operand()?,
                }
            }
            "in" => Filter::In {
                key: key()?,
                values: list()?,
            },
            "!in" => Filter::In {
                key: key()?,
                values: list()?,
            }
            .negate(),
            "has" => Filter::Has(key()?),
            "!has" => Filter::Has(key()?).negate(),
            other => return Err(invalid(json, &format!("unsupported operator {}", other))),
        };
        Ok(filter)
    }
}

fn invalid(json: &Json, reason: &str) -> Error {
    Error::Configuration(format!("invalid filter {}: {}", json, reason))
}

fn literal(json: &Json) -> Option<Value> {
    match json {
        Json::Null => Some(Value::Null),
        Json::Bool(b) => Some(Value::Bool(*b)),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_u64().map(Value::UInt))
            .or_else(|| n.as_f64().map(Value::Double)),
        Json::String(s) => Some(Value::String(s.clone())),
        _ => None,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::UInt(a), Value::UInt(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
}

fn equal(left: &Value, right: &Value) -> bool {
    order(left, right) == Some(Ordering::Equal)
}

/// Values of different types never compare equal or ordered.
fn compare(actual: &Value, op: Comparison, expected: &Value) -> bool {
    let ordering = order(actual, expected);
    match op {
        Comparison::Equal => ordering == Some(Ordering::Equal),
        Comparison::NotEqual => ordering != Some(Ordering::Equal),
        Comparison::Less => ordering == Some(Ordering::Less),
        Comparison::LessOrEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        Comparison::Greater => ordering == Some(Ordering::Greater),
        Comparison::GreaterOrEqual => {
            matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
        }
    }
}
