/// TileJSON metadata documents.
///
/// Further reading: https://github.com/mapbox/tilejson-spec/tree/master/3.0.0
use std::collections::BTreeMap;

use reqwest::Url;
use serde::Deserialize;

use crate::config::TileCoordinateSystem;
use crate::coord::MAX_ZOOM;
use crate::error::Error;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct VectorLayer {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "minzoom", default)]
    pub min_zoom: Option<u8>,
    #[serde(rename = "maxzoom", default)]
    pub max_zoom: Option<u8>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// The subset of a TileJSON document a vector source needs.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct TileJson {
    #[serde(default)]
    pub tilejson: Option<String>,
    pub tiles: Vec<String>,
    #[serde(rename = "minzoom", default)]
    pub min_zoom: Option<u8>,
    #[serde(rename = "maxzoom", default)]
    pub max_zoom: Option<u8>,
    #[serde(default)]
    pub attribution: Option<String>,
    #[serde(default)]
    pub scheme: Option<TileCoordinateSystem>,
    #[serde(default)]
    pub bounds: Option<[f64; 4]>,
    #[serde(default)]
    pub vector_layers: Vec<VectorLayer>,
}

impl TileJson {
    /// Parses a TileJSON document. Relative tile URLs are resolved against
    /// `base` when one is known.
    pub fn from(data: &[u8], base: Option<&Url>) -> Result<TileJson, Error> {
        let mut document: TileJson = serde_json::from_slice(data)?;

        document.tiles = document
            .tiles
            .iter()
            .map(|template| resolve_template(template, base))
            .collect();
        if document.template().is_none() {
            return Err(Error::Configuration(
                "TileJSON document has no usable tile URL template".to_owned(),
            ));
        }

        let min_zoom = document.min_zoom.unwrap_or(0);
        let max_zoom = document.max_zoom.unwrap_or(MAX_ZOOM);
        if min_zoom > max_zoom || max_zoom > MAX_ZOOM {
            return Err(Error::Configuration(format!(
                "TileJSON zoom range {}..{} is invalid",
                min_zoom, max_zoom
            )));
        }

        Ok(document)
    }

    /// The template tiles are fetched from. Only the first entry of `tiles`
    /// is ever used.
    pub fn template(&self) -> Option<&str> {
        self.tiles
            .first()
            .map(String::as_str)
            .filter(|template| !template.trim().is_empty())
    }
}

fn resolve_template(template: &str, base: Option<&Url>) -> String {
    if Url::parse(template).is_ok() {
        return template.to_owned();
    }
    // Url::join percent-encodes braces, so placeholders are put back after.
    match base.and_then(|base| base.join(template).ok()) {
        Some(joined) => joined
            .as_str()
            .replace("%7B", "{")
            .replace("%7D", "}"),
        None => template.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tilejson() {
        let data = br#"{
            "tilejson": "3.0.0",
            "tiles": ["https://a.example.com/{z}/{x}/{y}.pbf", "https://b.example.com/{z}/{x}/{y}.pbf"],
            "minzoom": 2,
            "maxzoom": 14,
            "attribution": "(c) OpenStreetMap contributors",
            "scheme": "tms",
            "bounds": [-180, -85, 180, 85],
            "vector_layers": [{"id": "water", "fields": {"class": "String"}}]
        }"#;
        let document = TileJson::from(data, None).expect("document should parse");

        assert_eq!(Some("https://a.example.com/{z}/{x}/{y}.pbf"), document.template());
        assert_eq!(Some(2), document.min_zoom);
        assert_eq!(Some(14), document.max_zoom);
        assert_eq!(Some(TileCoordinateSystem::Tms), document.scheme);
        assert_eq!("water", document.vector_layers[0].id);
        assert_eq!(Some(&"String".to_owned()), document.vector_layers[0].fields.get("class"));
    }

    #[test]
    fn test_relative_templates_resolve_against_document() {
        let base = Url::parse("https://tiles.example.com/planet/tiles.json").expect("url");
        let document = TileJson::from(br#"{"tiles": ["{z}/{x}/{y}.mvt"]}"#, Some(&base))
            .expect("document should parse");
        assert_eq!(
            Some("https://tiles.example.com/planet/{z}/{x}/{y}.mvt"),
            document.template()
        );
    }

    #[test]
    fn test_reject_documents_without_templates() {
        let result = TileJson::from(br#"{"tiles": []}"#, None);
        assert!(matches!(result, Err(Error::Configuration(_))));

        let result = TileJson::from(br#"{"name": "no tiles"}"#, None);
        assert!(matches!(result, Err(Error::TileJson(_))));

        let result = TileJson::from(b"not json", None);
        assert!(result.unwrap_err().is_configuration());
    }
}
