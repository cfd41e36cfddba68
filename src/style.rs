//! Mapbox GL sources and layers for the loaded datasets.
//!
//! The client adds `sources` and `layers` verbatim, so everything here must be
//! valid style-spec JSON. Radii used for hit testing come from the same stop
//! tables as the paint expressions.

use crate::config::{AppConfig, DatasetConfig, DatasetKind};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

pub const SCHOOLS_SOURCE: &str = "schools";
pub const SCHOOL_CLUSTERS: &str = "schools-clusters";
pub const SCHOOL_CLUSTER_COUNT: &str = "schools-cluster-count";
pub const SCHOOLS_UNCLUSTERED: &str = "schools-unclustered";
pub const DEM_OVERLAY: &str = "nasadem_merge";
pub const DEM_SOURCE: &str = "mapbox-dem";
pub const TERRAIN_TOGGLE: &str = "terrain3d";
pub const HILLSHADE: &str = "hillshade";

pub const TREE_RADIUS_STOPS: [(f64, f64); 3] = [(10.0, 3.0), (15.0, 6.0), (18.0, 8.0)];
pub const SCHOOL_RADIUS_STOPS: [(f64, f64); 3] = [(10.0, 4.0), (15.0, 6.0), (18.0, 8.0)];
pub const CLUSTER_RADIUS_BASE: f64 = 15.0;
pub const CLUSTER_RADIUS_STEPS: [(f64, f64); 4] = [(10.0, 20.0), (25.0, 25.0), (50.0, 30.0), (100.0, 35.0)];
const CLUSTER_COLOR_BASE: &str = "#9ae6b4";
const CLUSTER_COLOR_STEPS: [(f64, &str); 4] = [(10.0, "#4ade80"), (25.0, "#22c55e"), (50.0, "#16a34a"), (100.0, "#15803d")];
pub const TREE_STROKE: f64 = 1.0;
pub const SCHOOL_STROKE: f64 = 2.0;

const HIGHLIGHT_NONE: i64 = -1;
pub const WARD_FILL_OPACITY: f64 = 0.18;
pub const WARD_HOVER_OPACITY: f64 = 0.3;

/// `["interpolate", ["linear"], ["zoom"], ...]` evaluated at `zoom`.
pub fn interpolate(stops: &[(f64, f64)], zoom: f64) -> f64 {
    let (first, last) = match (stops.first(), stops.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return 0.0,
    };
    if zoom <= first.0 {
        return first.1;
    }
    if zoom >= last.0 {
        return last.1;
    }
    stops
        .windows(2)
        .find(|w| zoom >= w[0].0 && zoom <= w[1].0)
        .map(|w| {
            let t = (zoom - w[0].0) / (w[1].0 - w[0].0);
            w[0].1 + t * (w[1].1 - w[0].1)
        })
        .unwrap_or(last.1)
}

/// `["step", input, base, stop, value, ...]` evaluated at `input`.
pub fn step(base: f64, steps: &[(f64, f64)], input: f64) -> f64 {
    steps
        .iter()
        .take_while(|(threshold, _)| input >= *threshold)
        .last()
        .map(|(_, v)| *v)
        .unwrap_or(base)
}

fn interpolate_expr(stops: &[(f64, f64)]) -> Value {
    let mut expr = vec![json!("interpolate"), json!(["linear"]), json!(["zoom"])];
    for (z, v) in stops {
        expr.push(json!(z));
        expr.push(json!(v));
    }
    Value::Array(expr)
}

fn step_expr<T: Serialize>(base: T, steps: &[(f64, T)]) -> Value {
    let mut expr = vec![json!("step"), json!(["get", "point_count"]), json!(base)];
    for (threshold, v) in steps {
        expr.push(json!(threshold));
        expr.push(json!(v));
    }
    Value::Array(expr)
}

/// Which optional inputs made it through loading.
#[derive(Debug, Clone, Default)]
pub struct Availability {
    pub datasets: HashSet<String>,
    pub schools: bool,
    pub dem_overlay: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerSpec {
    #[serde(flatten)]
    pub layer: Value,
    /// Insert below this layer id when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

impl LayerSpec {
    fn new(layer: Value) -> Self {
        Self { layer, before: None }
    }

    fn before(layer: Value, before: impl Into<String>) -> Self {
        Self { layer, before: Some(before.into()) }
    }

    pub fn id(&self) -> &str {
        self.layer.get("id").and_then(Value::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleKind {
    Data,
    Terrain,
}

/// One checkbox and the layers it shows or hides.
#[derive(Debug, Clone, Serialize)]
pub struct ToggleGroup {
    pub id: String,
    pub label: String,
    pub description: String,
    pub kind: ToggleKind,
    pub layers: Vec<String>,
    pub checked: bool,
}

/// Ward layers the client restyles on hover and selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WardLayers {
    pub fill: String,
    pub highlight: String,
    pub highlight_fill: String,
    pub fill_opacity: f64,
    pub hover_opacity: f64,
}

impl WardLayers {
    pub fn for_dataset(id: &str) -> Self {
        Self {
            fill: fill_layer_id(id),
            highlight: highlight_layer_id(id),
            highlight_fill: highlight_fill_layer_id(id),
            fill_opacity: WARD_FILL_OPACITY,
            hover_opacity: WARD_HOVER_OPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MapStyle {
    pub style: String,
    pub center: [f64; 2],
    pub zoom: f64,
    pub sources: Map<String, Value>,
    pub layers: Vec<LayerSpec>,
    pub toggles: Vec<ToggleGroup>,
    pub terrain: Value,
    pub interactive_layers: Vec<String>,
    /// Present when the ward dataset loaded.
    pub ward_layers: Option<WardLayers>,
}

pub fn fill_layer_id(dataset: &str) -> String { format!("{dataset}-fill") }
pub fn line_layer_id(dataset: &str) -> String { format!("{dataset}-line") }
pub fn point_layer_id(dataset: &str) -> String { format!("{dataset}-point") }
pub fn highlight_layer_id(dataset: &str) -> String { format!("{dataset}-highlight") }
pub fn highlight_fill_layer_id(dataset: &str) -> String { format!("{dataset}-highlight-fill") }

/// Layers toggled together with the checkbox for `base`.
pub fn toggle_layers(base: &str) -> Vec<String> {
    if base == SCHOOLS_SOURCE {
        return vec![
            SCHOOL_CLUSTERS.to_string(),
            SCHOOL_CLUSTER_COUNT.to_string(),
            SCHOOLS_UNCLUSTERED.to_string(),
        ];
    }
    vec![fill_layer_id(base), line_layer_id(base), point_layer_id(base), base.to_string()]
}

/// Clickable layers, highest priority first.
pub fn interactive_layers(config: &AppConfig) -> Vec<String> {
    let mut layers = vec![SCHOOL_CLUSTERS.to_string(), SCHOOLS_UNCLUSTERED.to_string()];
    layers.extend(
        config.input.datasets.iter()
            .filter(|d| d.kind == DatasetKind::Trees)
            .map(|d| point_layer_id(&d.id)),
    );
    layers.extend(config.ward_dataset().map(|d| fill_layer_id(&d.id)));
    layers
}

fn dataset_layers(dataset: &DatasetConfig) -> Vec<LayerSpec> {
    let id = &dataset.id;
    let color = &dataset.color;
    let is_wards = dataset.kind == DatasetKind::Wards;

    let mut layers = vec![
        LayerSpec::new(json!({
            "id": fill_layer_id(id),
            "type": "fill",
            "source": id,
            "filter": ["==", ["geometry-type"], "Polygon"],
            "paint": {
                "fill-color": color,
                "fill-opacity": if is_wards { WARD_FILL_OPACITY } else { 0.25 },
                "fill-outline-color": color
            }
        })),
        LayerSpec::new(json!({
            "id": line_layer_id(id),
            "type": "line",
            "source": id,
            "paint": {
                "line-color": color,
                "line-width": if is_wards { 1.5 } else { 1.2 },
                "line-opacity": 0.8
            }
        })),
        LayerSpec::new(json!({
            "id": point_layer_id(id),
            "type": "circle",
            "source": id,
            "filter": ["==", ["geometry-type"], "Point"],
            "paint": {
                "circle-radius": interpolate_expr(&TREE_RADIUS_STOPS),
                "circle-color": color,
                "circle-stroke-width": TREE_STROKE,
                "circle-stroke-color": "#ffffff",
                "circle-opacity": 0.8
            }
        })),
    ];

    if is_wards {
        layers.push(LayerSpec::before(
            json!({
                "id": highlight_fill_layer_id(id),
                "type": "fill",
                "source": id,
                "filter": ["==", ["id"], HIGHLIGHT_NONE],
                "paint": {
                    "fill-color": "#fde68a",
                    "fill-opacity": 0.4,
                    "fill-outline-color": "#f59e0b"
                }
            }),
            line_layer_id(id),
        ));
        layers.push(LayerSpec::new(json!({
            "id": highlight_layer_id(id),
            "type": "line",
            "source": id,
            "filter": ["==", ["id"], HIGHLIGHT_NONE],
            "paint": {
                "line-color": "#f59e0b",
                "line-width": 4,
                "line-opacity": 0.9
            }
        })));
    }
    layers
}

fn school_layers() -> Vec<LayerSpec> {
    vec![
        LayerSpec::new(json!({
            "id": SCHOOL_CLUSTERS,
            "type": "circle",
            "source": SCHOOLS_SOURCE,
            "filter": ["has", "point_count"],
            "paint": {
                "circle-color": step_expr(CLUSTER_COLOR_BASE, &CLUSTER_COLOR_STEPS),
                "circle-radius": step_expr(CLUSTER_RADIUS_BASE, &CLUSTER_RADIUS_STEPS),
                "circle-stroke-width": SCHOOL_STROKE,
                "circle-stroke-color": "#ffffff",
                "circle-opacity": 0.8
            }
        })),
        LayerSpec::new(json!({
            "id": SCHOOL_CLUSTER_COUNT,
            "type": "symbol",
            "source": SCHOOLS_SOURCE,
            "filter": ["has", "point_count"],
            "layout": {
                "text-field": ["get", "point_count_abbreviated"],
                "text-size": ["step", ["get", "point_count"], 12, 25, 14, 100, 16],
                "text-font": ["DIN Offc Pro Medium", "Arial Unicode MS Bold"]
            },
            "paint": {
                "text-color": "#1f2937",
                "text-halo-color": "#ffffff",
                "text-halo-width": 1
            }
        })),
        LayerSpec::new(json!({
            "id": SCHOOLS_UNCLUSTERED,
            "type": "circle",
            "source": SCHOOLS_SOURCE,
            "filter": ["!", ["has", "point_count"]],
            "paint": {
                "circle-radius": interpolate_expr(&SCHOOL_RADIUS_STOPS),
                "circle-color": "#F54927",
                "circle-stroke-width": SCHOOL_STROKE,
                "circle-stroke-color": "#ffffff",
                "circle-opacity": 0.85
            }
        })),
    ]
}

fn terrain_toggles() -> Vec<ToggleGroup> {
    [
        (DEM_OVERLAY, "DEM Overlay", "NASA Digital Elevation Model"),
        (TERRAIN_TOGGLE, "3D Terrain", "Enable 3D terrain visualization"),
        (HILLSHADE, "Hillshade", "Terrain shading effect"),
    ]
    .into_iter()
    .map(|(id, label, description)| ToggleGroup {
        id: id.to_string(),
        label: label.to_string(),
        description: description.to_string(),
        kind: ToggleKind::Terrain,
        layers: if id == TERRAIN_TOGGLE { Vec::new() } else { vec![id.to_string()] },
        checked: true,
    })
    .collect()
}

/// Builds the full style for the client from configuration and load results.
pub fn build_style(config: &AppConfig, available: &Availability) -> MapStyle {
    let mut sources = Map::new();
    let mut layers = Vec::new();
    let mut toggles = Vec::new();

    for dataset in &config.input.datasets {
        toggles.push(ToggleGroup {
            id: dataset.id.clone(),
            label: dataset.label.clone(),
            description: dataset.description.clone().unwrap_or_else(|| dataset.label.clone()),
            kind: ToggleKind::Data,
            layers: toggle_layers(&dataset.id),
            checked: true,
        });
        if !available.datasets.contains(&dataset.id) {
            continue;
        }
        let mut source = json!({
            "type": "geojson",
            "data": format!("/api/datasets/{}", dataset.id),
        });
        match dataset.kind {
            DatasetKind::Wards => source["generateId"] = json!(true),
            DatasetKind::Trees => source["cluster"] = json!(false),
        }
        sources.insert(dataset.id.clone(), source);
        layers.extend(dataset_layers(dataset));
    }

    if available.schools {
        sources.insert(
            SCHOOLS_SOURCE.to_string(),
            json!({
                "type": "geojson",
                "data": format!("/api/datasets/{SCHOOLS_SOURCE}"),
                "cluster": true,
                "clusterRadius": config.analytics.cluster_radius,
                "clusterMaxZoom": config.analytics.cluster_max_zoom,
            }),
        );
        layers.extend(school_layers());
        toggles.push(ToggleGroup {
            id: SCHOOLS_SOURCE.to_string(),
            label: "Schools".to_string(),
            description: "School locations (clustered)".to_string(),
            kind: ToggleKind::Data,
            layers: toggle_layers(SCHOOLS_SOURCE),
            checked: true,
        });
    }

    // DEM image goes beneath the first tree points so dots stay visible.
    let first_points = layers
        .iter()
        .map(|l| l.id().to_string())
        .find(|id| id.ends_with("-point"));
    if let (true, Some(url)) = (available.dem_overlay, config.dem.overlay.as_ref()) {
        let [west, south, east, north] = config.dem.overlay_bounds;
        sources.insert(
            DEM_OVERLAY.to_string(),
            json!({
                "type": "image",
                "url": url,
                "coordinates": [[west, north], [east, north], [east, south], [west, south]]
            }),
        );
        let overlay = json!({
            "id": DEM_OVERLAY,
            "type": "raster",
            "source": DEM_OVERLAY,
            "paint": { "raster-opacity": 0.6, "raster-fade-duration": 300 }
        });
        layers.push(match first_points {
            Some(before) => LayerSpec::before(overlay, before),
            None => LayerSpec::new(overlay),
        });
    }

    sources.insert(
        DEM_SOURCE.to_string(),
        json!({
            "type": "raster-dem",
            "url": config.dem.terrain_source,
            "tileSize": 512,
            "maxzoom": 14
        }),
    );
    layers.push(LayerSpec::new(json!({
        "id": HILLSHADE,
        "type": "hillshade",
        "source": DEM_SOURCE,
        "layout": { "visibility": "visible" },
        "paint": {
            "hillshade-exaggeration": 0.8,
            "hillshade-shadow-color": "#1f2937",
            "hillshade-highlight-color": "#f9fafb",
            "hillshade-illumination-direction": 315
        }
    })));
    layers.push(LayerSpec::new(json!({
        "id": "sky",
        "type": "sky",
        "paint": {
            "sky-type": "atmosphere",
            "sky-atmosphere-sun-intensity": 8,
            "sky-atmosphere-sun": [0.0, 90.0],
            "sky-atmosphere-halo-color": "rgba(85, 151, 210, 0.5)"
        }
    })));
    toggles.extend(terrain_toggles());

    MapStyle {
        style: config.map.style.clone(),
        center: config.map.center,
        zoom: config.map.zoom,
        sources,
        layers,
        toggles,
        terrain: json!({ "source": DEM_SOURCE, "exaggeration": config.dem.exaggeration }),
        interactive_layers: interactive_layers(config),
        ward_layers: config.ward_dataset()
            .filter(|d| available.datasets.contains(&d.id))
            .map(|d| WardLayers::for_dataset(&d.id)),
    }
}
