use crate::cluster::ClusterIndex;
use crate::config::{AppConfig, DatasetConfig, DatasetKind};
use crate::elevation::{ElevationSource, RasterDem};
use crate::style::{Availability, SCHOOLS_SOURCE};
use crate::types::{School, TreePoint, Ward};
use anyhow::{anyhow, Context, Result};
use geo::{BoundingRect, Coord, MultiPolygon, Point, Rect};
use geojson::feature::Id;
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, Value};
use rstar::primitives::GeomWithData;
use rstar::{RTree, RTreeObject, AABB};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

pub type PointIndex = RTree<GeomWithData<[f64; 2], usize>>;

// Wrapper for RTree indexing of ward bounding boxes
pub struct WardEnvelope {
    pub index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for WardEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Counts finished load steps for the loading indicator.
#[derive(Debug)]
pub struct LoadProgress {
    steps: AtomicUsize,
    total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub steps: usize,
    pub total: usize,
    pub percent: u32,
}

impl LoadProgress {
    /// One step per dataset plus schools and the DEM.
    pub fn for_config(config: &AppConfig) -> Self {
        Self::new(config.input.datasets.len() + 2)
    }

    pub fn new(total: usize) -> Self {
        Self { steps: AtomicUsize::new(0), total: total.max(1) }
    }

    pub fn step(&self) -> ProgressSnapshot {
        self.steps.fetch_add(1, Ordering::SeqCst);
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let steps = self.steps.load(Ordering::SeqCst).min(self.total);
        let percent = ((steps as f64 / self.total as f64) * 100.0).round() as u32;
        ProgressSnapshot { steps, total: self.total, percent }
    }

    pub fn is_complete(&self) -> bool {
        self.snapshot().steps >= self.total
    }
}

/// Everything loaded at start-up, immutable afterwards.
pub struct Catalog {
    /// Loaded collections by dataset id, `schools` included.
    pub collections: HashMap<String, FeatureCollection>,
    pub trees: Vec<TreePoint>,
    pub tree_index: PointIndex,
    pub schools: Option<Vec<School>>,
    pub school_index: PointIndex,
    pub school_clusters: Option<ClusterIndex>,
    pub wards: Vec<Ward>,
    /// Ward feature id to position in `wards`; ids skip non-polygon features.
    ward_positions: HashMap<usize, usize>,
    pub ward_index: RTree<WardEnvelope>,
    /// Extent of every declared dataset that loaded.
    pub bounds: Option<Rect<f64>>,
    pub elevation: Option<Box<dyn ElevationSource>>,
    pub dem_overlay: bool,
}

impl Catalog {
    pub fn availability(&self) -> Availability {
        Availability {
            datasets: self.collections.keys()
                .filter(|k| k.as_str() != SCHOOLS_SOURCE)
                .cloned()
                .collect(),
            schools: self.schools.is_some(),
            dem_overlay: self.dem_overlay,
        }
    }

    /// Ward by feature id, the id served to the client and stored in the index.
    pub fn ward(&self, id: usize) -> Option<&Ward> {
        self.wards.get(*self.ward_positions.get(&id)?)
    }

    /// `[[west, south], [east, north]]` for fitting the initial view.
    pub fn bounds_array(&self) -> Option<[[f64; 2]; 2]> {
        self.bounds.map(|r| [[r.min().x, r.min().y], [r.max().x, r.max().y]])
    }
}

pub fn point_index<'a, I>(points: I) -> PointIndex
where
    I: IntoIterator<Item = &'a Point<f64>>,
{
    RTree::bulk_load(
        points.into_iter()
            .enumerate()
            .map(|(i, p)| GeomWithData::new([p.x(), p.y()], i))
            .collect(),
    )
}

/// Assembles a catalog, building the spatial indexes.
pub struct CatalogBuilder {
    collections: HashMap<String, FeatureCollection>,
    trees: Vec<TreePoint>,
    schools: Option<Vec<School>>,
    wards: Vec<Ward>,
    bounds: Option<Rect<f64>>,
    elevation: Option<Box<dyn ElevationSource>>,
    dem_overlay: bool,
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self {
            collections: HashMap::new(),
            trees: Vec::new(),
            schools: None,
            wards: Vec::new(),
            bounds: None,
            elevation: None,
            dem_overlay: false,
        }
    }

    pub fn trees(&mut self, dataset: &str, collection: FeatureCollection) -> &mut Self {
        self.trees.extend(tree_points(dataset, &collection));
        self.add_collection(dataset, collection, true);
        self
    }

    pub fn wards(&mut self, dataset: &str, collection: FeatureCollection) -> Result<&mut Self> {
        let (wards, collection) = wards_from_collection(collection)?;
        self.wards = wards;
        self.add_collection(dataset, collection, true);
        Ok(self)
    }

    pub fn schools(&mut self, collection: FeatureCollection) -> &mut Self {
        self.schools = Some(
            collection.features.iter()
                .filter_map(|f| Some(School { point: feature_point(f)?, properties: properties_of(f) }))
                .collect(),
        );
        self.add_collection(SCHOOLS_SOURCE, collection, false);
        self
    }

    pub fn elevation(&mut self, source: Box<dyn ElevationSource>) -> &mut Self {
        self.elevation = Some(source);
        self
    }

    pub fn dem_overlay(&mut self, present: bool) -> &mut Self {
        self.dem_overlay = present;
        self
    }

    fn add_collection(&mut self, id: &str, collection: FeatureCollection, extend_bounds: bool) {
        if extend_bounds {
            for feature in &collection.features {
                if let Some(geometry) = &feature.geometry {
                    extend_bounds_from_value(&geometry.value, &mut self.bounds);
                }
            }
        }
        self.collections.insert(id.to_string(), collection);
    }

    pub fn build(self, cluster_radius: f64, cluster_max_zoom: u8) -> Catalog {
        let tree_index = point_index(self.trees.iter().map(|t| &t.point));
        let school_points: Vec<Point<f64>> = self.schools.iter().flatten().map(|s| s.point).collect();
        let school_index = point_index(school_points.iter());
        let school_clusters = self
            .schools
            .as_ref()
            .map(|_| ClusterIndex::build(&school_points, cluster_radius, cluster_max_zoom));
        let ward_index = RTree::bulk_load(
            self.wards.iter()
                .filter_map(|ward| {
                    let rect = ward.geometry.bounding_rect()?;
                    Some(WardEnvelope {
                        index: ward.id,
                        aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                    })
                })
                .collect(),
        );

        let ward_positions = self.wards.iter()
            .enumerate()
            .map(|(position, ward)| (ward.id, position))
            .collect();

        Catalog {
            collections: self.collections,
            trees: self.trees,
            tree_index,
            schools: self.schools,
            school_index,
            school_clusters,
            wards: self.wards,
            ward_positions,
            ward_index,
            bounds: self.bounds,
            elevation: self.elevation,
            dem_overlay: self.dem_overlay,
        }
    }
}

/// Loads every configured input. Individual failures are logged and skipped;
/// the returned catalog holds whatever succeeded.
pub fn load_catalog(config: &AppConfig, progress: &LoadProgress) -> Catalog {
    let mut builder = CatalogBuilder::new();

    // 1. Schools
    if let Some(url) = &config.input.schools {
        match read_feature_collection(&config.public_path(url)) {
            Ok(fc) => {
                info!("Loaded {} schools", fc.features.len());
                builder.schools(fc);
            }
            Err(e) => warn!("Could not load schools: {:#}", e),
        }
    }
    progress.step();

    // 2. Declared datasets, in order
    for dataset in &config.input.datasets {
        if let Err(e) = load_dataset(config, dataset, &mut builder) {
            error!("Failed to load {}: {:#}", dataset.label, e);
        }
        progress.step();
    }
    info!("Total trees loaded: {}", builder.trees.len());

    // 3. DEM
    if let Some(raster) = &config.dem.elevation {
        match RasterDem::open(raster) {
            Ok(dem) => {
                builder.elevation(Box::new(dem));
            }
            Err(e) => warn!("Elevation sampling disabled: {:#}", e),
        }
    }
    if let Some(url) = &config.dem.overlay {
        let present = config.public_path(url).exists();
        if !present {
            warn!("DEM overlay image not found: {}", url);
        }
        builder.dem_overlay(present);
    }
    progress.step();

    builder.build(config.analytics.cluster_radius, config.analytics.cluster_max_zoom)
}

fn load_dataset(config: &AppConfig, dataset: &DatasetConfig, builder: &mut CatalogBuilder) -> Result<()> {
    let path = config.public_path(&dataset.url);
    let collection = match dataset.kind {
        DatasetKind::Wards => read_boundaries(&path)?,
        DatasetKind::Trees => read_feature_collection(&path)?,
    };
    info!("Loaded {}: {} features", dataset.label, collection.features.len());

    match dataset.kind {
        DatasetKind::Trees => {
            builder.trees(&dataset.id, collection);
        }
        DatasetKind::Wards => {
            builder.wards(&dataset.id, collection)?;
        }
    }
    Ok(())
}

pub fn read_feature_collection(path: &Path) -> Result<FeatureCollection> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let reader = BufReader::new(file);

    // Parse the GeoJSON. warning: this loads the whole file into memory.
    let geojson = GeoJson::from_reader(reader)
        .with_context(|| format!("Failed to parse GeoJSON: {:?}", path))?;

    match geojson {
        GeoJson::FeatureCollection(fc) => Ok(fc),
        _ => Err(anyhow!("GeoJSON must be a FeatureCollection: {:?}", path)),
    }
}

/// Ward boundaries from GeoJSON or an ESRI Shapefile, picked by extension.
pub fn read_boundaries(path: &Path) -> Result<FeatureCollection> {
    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Boundary file has no extension: {:?}", path))?;

    match extension.as_str() {
        "shp" => read_shapefile(path),
        "json" | "geojson" => read_feature_collection(path),
        _ => Err(anyhow!("Unsupported geometry format: {}", extension)),
    }
}

fn read_shapefile(path: &Path) -> Result<FeatureCollection> {
    let mut reader = shapefile::Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut features = Vec::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?,
            shapefile::Shape::PolygonM(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?,
            _ => continue, // Skip non-polygon shapes
        };

        let properties: JsonObject = record
            .into_iter()
            .map(|(name, value)| (name, field_to_json(value)))
            .collect();

        features.push(Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(Value::from(&geometry))),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        });
    }

    Ok(FeatureCollection { bbox: None, features, foreign_members: None })
}

fn field_to_json(value: shapefile::dbase::FieldValue) -> serde_json::Value {
    use shapefile::dbase::FieldValue;
    use serde_json::Value as Json;

    match value {
        FieldValue::Character(Some(s)) => Json::String(s.trim().to_string()),
        FieldValue::Memo(s) => Json::String(s),
        FieldValue::Numeric(Some(n)) => serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null),
        FieldValue::Double(n) | FieldValue::Currency(n) => {
            serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
        }
        FieldValue::Float(Some(n)) => {
            serde_json::Number::from_f64(n as f64).map(Json::Number).unwrap_or(Json::Null)
        }
        FieldValue::Integer(n) => Json::from(n),
        FieldValue::Logical(Some(b)) => Json::Bool(b),
        _ => Json::Null,
    }
}

fn properties_of(feature: &Feature) -> JsonObject {
    feature.properties.clone().unwrap_or_default()
}

fn feature_point(feature: &Feature) -> Option<Point<f64>> {
    match &feature.geometry.as_ref()?.value {
        Value::Point(pos) if pos.len() >= 2 => Some(Point::new(pos[0], pos[1])),
        _ => None,
    }
}

fn tree_points(dataset: &str, collection: &FeatureCollection) -> Vec<TreePoint> {
    collection.features.iter()
        .filter_map(|f| {
            Some(TreePoint {
                dataset: dataset.to_string(),
                point: feature_point(f)?,
                properties: properties_of(f),
            })
        })
        .collect()
}

/// Converts ward features to polygons and stamps each served feature with its
/// index so client-side highlight filters can match on `["id"]`.
fn wards_from_collection(mut collection: FeatureCollection) -> Result<(Vec<Ward>, FeatureCollection)> {
    let mut wards = Vec::new();
    for (index, feature) in collection.features.iter_mut().enumerate() {
        feature.id = Some(Id::Number(index.into()));

        let Some(geometry) = &feature.geometry else {
            continue;
        };
        let valid_geo: geo::Geometry<f64> = geometry.value.clone().try_into()
            .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;
        let geometry = match valid_geo {
            geo::Geometry::MultiPolygon(mp) => mp,
            geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
            _ => continue, // Skip points/lines
        };

        wards.push(Ward {
            id: index,
            geometry,
            properties: properties_of(feature),
        });
    }
    Ok((wards, collection))
}

fn include(bounds: &mut Option<Rect<f64>>, x: f64, y: f64) {
    let c = Coord { x, y };
    *bounds = Some(match bounds.take() {
        None => Rect::new(c, c),
        Some(r) => Rect::new(
            Coord { x: r.min().x.min(x), y: r.min().y.min(y) },
            Coord { x: r.max().x.max(x), y: r.max().y.max(y) },
        ),
    });
}

fn extend_bounds_from_value(value: &Value, bounds: &mut Option<Rect<f64>>) {
    fn position(pos: &[f64], bounds: &mut Option<Rect<f64>>) {
        if pos.len() >= 2 && pos[0].is_finite() && pos[1].is_finite() {
            include(bounds, pos[0], pos[1]);
        }
    }

    match value {
        Value::Point(p) => position(p, bounds),
        Value::MultiPoint(ps) | Value::LineString(ps) => {
            ps.iter().for_each(|p| position(p, bounds))
        }
        Value::MultiLineString(lines) | Value::Polygon(lines) => {
            lines.iter().flatten().for_each(|p| position(p, bounds))
        }
        Value::MultiPolygon(polys) => {
            polys.iter().flatten().flatten().for_each(|p| position(p, bounds))
        }
        Value::GeometryCollection(geoms) => {
            geoms.iter().for_each(|g| extend_bounds_from_value(&g.value, bounds))
        }
    }
}
