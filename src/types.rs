use geo::{MultiPolygon, Point};
use geojson::JsonObject;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct TreePoint {
    pub dataset: String, // id of the tree dataset the point came from
    pub point: Point<f64>,
    pub properties: JsonObject,
}

#[derive(Debug, Clone)]
pub struct School {
    pub point: Point<f64>,
    pub properties: JsonObject,
}

#[derive(Debug, Clone)]
pub struct Ward {
    /// Position in the ward collection; also the feature id served to the client.
    pub id: usize,
    pub geometry: MultiPolygon<f64>,
    pub properties: JsonObject,
}

/// Text form of a property for display, treating null, `false`, `0`, `""` and
/// `"NULL"` as absent.
pub fn display_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::Bool(true) => Some("true".to_string()),
        Value::Number(n) => {
            if n.as_f64() == Some(0.0) {
                None
            } else {
                Some(n.to_string())
            }
        }
        Value::String(s) if s.is_empty() || s == "NULL" => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Returns the property as text if it is present and not null or empty.
/// Unlike [`display_value`] a numeric zero counts as present.
pub fn present_value(props: &JsonObject, key: &str) -> Option<String> {
    match props.get(key)? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// First key in `keys` that carries a present value.
pub fn first_present(props: &JsonObject, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| present_value(props, key))
}

/// First key in `keys` whose value is not null, empty strings included.
pub fn first_non_null(props: &JsonObject, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match props.get(*key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}

/// First key in `keys` whose value passes [`display_value`].
pub fn first_displayable(props: &JsonObject, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| props.get(*key))
        .find_map(display_value)
}
