use geo_types::Geometry;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};
use crate::geometry::{geometry_to_geojson, parse_geojson_geometry, representative_point, GeoPoint};

/// Property keys consulted for a display name, highest priority first.
const NAME_KEYS: [&str; 4] = ["NAME", "Name", "name", "display_name"];

#[derive(Debug, Clone, PartialEq)]
pub struct SiteRecord {
    pub id: i64,
    pub name: Option<String>,
    pub properties: Map<String, Value>,
    pub geometry: Geometry<f64>,
}

impl SiteRecord {
    /// Explicit name first, then the property mapping in [`NAME_KEYS`] order.
    pub fn display_name(&self) -> Option<&str> {
        resolve_display_name(self.name.as_deref(), &self.properties)
    }

    /// Name as stored in the property mapping, ignoring the explicit name.
    pub fn property_name(&self) -> Option<&str> {
        property_name(&self.properties)
    }

    pub fn representative_point(&self) -> Option<GeoPoint> {
        representative_point(&self.geometry)
    }

    pub fn to_feature(&self) -> Feature {
        let mut properties = self.properties.clone();
        if let Some(name) = non_blank(self.name.as_deref()) {
            properties
                .entry("name")
                .or_insert_with(|| Value::String(name.to_string()));
        }
        Feature::new(
            FeatureId::Site(self.id),
            properties,
            geometry_to_geojson(&self.geometry),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSite {
    pub name: Option<String>,
    pub properties: Map<String, Value>,
    pub geometry: Geometry<f64>,
}

impl NewSite {
    pub fn new(
        name: Option<String>,
        properties: Map<String, Value>,
        geometry: Geometry<f64>,
    ) -> AppResult<Self> {
        crate::geometry::validate_geometry(&geometry)?;
        Ok(Self {
            name: name.filter(|n| !n.trim().is_empty()),
            properties,
            geometry,
        })
    }

    pub fn from_geojson(name: Option<String>, properties: Value, geometry: &Value) -> AppResult<Self> {
        let properties = match properties {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(AppError::invalid("properties must be an object")),
        };
        let geometry = parse_geojson_geometry(geometry)?;
        Self::new(name, properties, geometry)
    }

    pub fn representative_point(&self) -> Option<GeoPoint> {
        representative_point(&self.geometry)
    }
}

pub fn resolve_display_name<'a>(
    name: Option<&'a str>,
    properties: &'a Map<String, Value>,
) -> Option<&'a str> {
    non_blank(name).or_else(|| property_name(properties))
}

fn property_name(properties: &Map<String, Value>) -> Option<&str> {
    NAME_KEYS
        .iter()
        .find_map(|key| non_blank(properties.get(*key).and_then(Value::as_str)))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Local,
    External,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Local => "local",
            Provenance::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FeatureId {
    Site(i64),
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    pub id: FeatureId,
    pub properties: Map<String, Value>,
    pub geometry: Value,
}

impl Feature {
    pub fn new(id: FeatureId, properties: Map<String, Value>, geometry: Value) -> Self {
        Self {
            kind: "Feature",
            id,
            properties,
            geometry,
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// Uniform response shape handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    kind: &'static str,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: "FeatureCollection",
            features,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl FromIterator<Feature> for FeatureCollection {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
