use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A raw table row as returned by the remote store.
pub type Row = Map<String, Value>;

/// Census fields of a manzana, keyed by column name.
pub type Properties = Map<String, Value>;

/// Column holding the pre-encoded GeoJSON boundary.
pub const GEOMETRY_COLUMN: &str = "geom";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    #[default]
    Feature,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureCollectionKind {
    #[default]
    FeatureCollection,
}

/// One census block. The geometry is kept exactly as the store encoded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default)]
    pub kind: FeatureKind,
    #[serde(default)]
    pub geometry: Value,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Properties,
}

impl Feature {
    pub fn new(geometry: Value, properties: Properties) -> Self {
        Self {
            kind: FeatureKind::Feature,
            geometry,
            properties,
        }
    }

    /// Numeric value of a property; missing, null or non-numeric values read as zero.
    pub fn number(&self, field: &str) -> f64 {
        number(&self.properties, field)
    }

    /// Property read as a whole count.
    pub fn count(&self, field: &str) -> i64 {
        self.number(field).round() as i64
    }

    /// Categorical property, e.g. the comuna name.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.properties.get(field).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default)]
    pub kind: FeatureCollectionKind,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: FeatureCollectionKind::FeatureCollection,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// A WGS84 bounding box as accepted by the spatial RPC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub const fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Self {
        Self {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        }
    }
}

/// Coerces a property to `f64`. Numeric strings are accepted since some
/// PostgREST numeric columns arrive quoted.
pub fn number(properties: &Properties, field: &str) -> f64 {
    let value = match properties.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Properties, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Properties>::deserialize(deserializer)?.unwrap_or_default())
}
