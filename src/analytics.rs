use crate::config::AnalyticsConfig;
use crate::data::Catalog;
use crate::elevation::ElevationSource;
use crate::types::{first_non_null, first_present, present_value, Ward};
use geo::{BoundingRect, ChamberlainDuquetteArea, Contains, HaversineDistance, Intersects, MultiPolygon, Point};
use geojson::JsonObject;
use parking_lot::Mutex;
use rstar::AABB;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Property names tried in order for a tree's common name.
pub const TREE_FIELDS: [&str; 6] = ["TreeName", "KGISTreeID", "type", "Type", "tree", "Tree"];
const WARD_NUMBER_FIELDS: [&str; 4] = ["KGISWardNo", "ward_no", "Ward_No", "WARDNO"];
const WARD_NAME_FIELDS: [&str; 4] = ["KGISWardName", "ward_name", "name", "Ward_Name"];

pub const PIE_COLORS: [&str; 11] = [
    "#60a5fa", "#f87171", "#34d399", "#fbbf24", "#a78bfa", "#22d3ee",
    "#fb7185", "#a3e635", "#f472b6", "#2dd4bf", "#fda4af",
];
const LABEL_MAX_CHARS: usize = 15;

pub fn tree_name(props: &JsonObject) -> String {
    first_present(props, &TREE_FIELDS).unwrap_or_else(|| "Unknown".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WardIdentity {
    pub number: Option<String>,
    pub name: String,
}

pub fn ward_identity(props: &JsonObject) -> WardIdentity {
    let number = first_non_null(props, &WARD_NUMBER_FIELDS);
    let name = first_non_null(props, &WARD_NAME_FIELDS).unwrap_or_else(|| match &number {
        Some(n) if !n.is_empty() => format!("Ward #{n}"),
        _ => "—".to_string(),
    });
    WardIdentity { number, name }
}

/// One slice of the species pie chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeciesSlice {
    pub name: String,
    /// Display label, shortened for the chart legend.
    pub label: String,
    pub count: usize,
    pub color: String,
    pub percentage: f64,
}

fn chart_label(name: &str) -> String {
    if name.chars().count() > LABEL_MAX_CHARS {
        let head: String = name.chars().take(LABEL_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        name.to_string()
    }
}

/// Species counts in first-seen order.
pub fn species_counts<'a, I>(props: I) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = &'a JsonObject>,
{
    let mut order: Vec<(String, usize)> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for p in props {
        let name = tree_name(p);
        match position.get(&name) {
            Some(&i) => order[i].1 += 1,
            None => {
                position.insert(name.clone(), order.len());
                order.push((name, 1));
            }
        }
    }
    order
}

pub fn species_chart(counts: &[(String, usize)]) -> Vec<SpeciesSlice> {
    let total: usize = counts.iter().map(|(_, c)| c).sum();
    counts
        .iter()
        .enumerate()
        .map(|(i, (name, count))| SpeciesSlice {
            name: name.clone(),
            label: chart_label(name),
            count: *count,
            color: PIE_COLORS[i % PIE_COLORS.len()].to_string(),
            percentage: if total == 0 {
                0.0
            } else {
                ((*count as f64 / total as f64) * 1000.0).round() / 10.0
            },
        })
        .collect()
}

fn envelope_of(geometry: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    let rect = geometry.bounding_rect()?;
    Some(AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]))
}

/// Indices of trees inside (or on the edge of) the ward, ascending.
pub fn trees_within(catalog: &Catalog, ward: &Ward) -> Vec<usize> {
    let Some(envelope) = envelope_of(&ward.geometry) else {
        return Vec::new();
    };
    let mut inside: Vec<usize> = catalog
        .tree_index
        .locate_in_envelope_intersecting(&envelope)
        .filter(|p| ward.geometry.intersects(&Point::new(p.geom()[0], p.geom()[1])))
        .map(|p| p.data)
        .collect();
    inside.sort_unstable();
    inside
}

pub fn schools_within(catalog: &Catalog, ward: &Ward) -> usize {
    if catalog.schools.is_none() {
        return 0;
    }
    let Some(envelope) = envelope_of(&ward.geometry) else {
        return 0;
    };
    catalog
        .school_index
        .locate_in_envelope_intersecting(&envelope)
        .filter(|p| ward.geometry.intersects(&Point::new(p.geom()[0], p.geom()[1])))
        .count()
}

pub fn area_m2(geometry: &MultiPolygon<f64>) -> f64 {
    geometry.chamberlain_duquette_unsigned_area()
}

/// Grid spacing in metres, coarser for larger wards.
pub fn adaptive_step(area_m2: f64) -> f64 {
    if area_m2 < 1_000_000.0 {
        150.0
    } else if area_m2 < 5_000_000.0 {
        250.0
    } else {
        350.0
    }
}

/// Regular grid of points `cell_side` metres apart, centred in the bounding
/// box and kept only where strictly inside the polygon.
pub fn point_grid(geometry: &MultiPolygon<f64>, cell_side: f64) -> Vec<Point<f64>> {
    let Some(rect) = geometry.bounding_rect() else {
        return Vec::new();
    };
    let (west, south) = (rect.min().x, rect.min().y);
    let (east, north) = (rect.max().x, rect.max().y);
    let sw = Point::new(west, south);

    let x_fraction = cell_side / sw.haversine_distance(&Point::new(east, south));
    let cell_width = x_fraction * (east - west);
    let y_fraction = cell_side / sw.haversine_distance(&Point::new(west, north));
    let cell_height = y_fraction * (north - south);
    if !(cell_width.is_finite() && cell_height.is_finite() && cell_width > 0.0 && cell_height > 0.0) {
        return Vec::new();
    }

    let bbox_width = east - west;
    let bbox_height = north - south;
    let columns = (bbox_width / cell_width).floor();
    let rows = (bbox_height / cell_height).floor();
    let delta_x = (bbox_width - columns * cell_width) / 2.0;
    let delta_y = (bbox_height - rows * cell_height) / 2.0;

    let mut points = Vec::new();
    let mut x = west + delta_x;
    while x <= east {
        let mut y = south + delta_y;
        while y <= north {
            let pt = Point::new(x, y);
            if geometry.contains(&pt) {
                points.push(pt);
            }
            y += cell_height;
        }
        x += cell_width;
    }
    points
}

#[derive(Debug, Default, Clone, Copy)]
struct Mean {
    sum: f64,
    n: usize,
}

impl Mean {
    fn add_batch(&mut self, source: &dyn ElevationSource, batch: &[Point<f64>]) {
        for pt in batch {
            if let Some(z) = source.elevation_at(pt.x(), pt.y()).filter(|z| z.is_finite()) {
                self.sum += z;
                self.n += 1;
            }
        }
    }

    fn value(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

/// Mean of the finite samples. Yields to the runtime after the first batch and
/// then after every `yield_every` batches.
pub async fn mean_elevation(
    source: &dyn ElevationSource,
    points: &[Point<f64>],
    batch_size: usize,
    yield_every: usize,
) -> Option<f64> {
    let mut mean = Mean::default();
    for (i, batch) in points.chunks(batch_size.max(1)).enumerate() {
        mean.add_batch(source, batch);
        if i % yield_every.max(1) == 0 {
            tokio::task::yield_now().await;
        }
    }
    mean.value()
}

pub fn mean_elevation_blocking(source: &dyn ElevationSource, points: &[Point<f64>]) -> Option<f64> {
    let mut mean = Mean::default();
    mean.add_batch(source, points);
    mean.value()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WardSummary {
    pub ward_id: usize,
    pub number: Option<String>,
    pub name: String,
    /// `KGISWardID` when present.
    pub code: Option<String>,
    /// Rounded to two decimals.
    pub area_km2: f64,
    pub schools: usize,
    /// Schools per km², zero when the ward has none.
    pub school_density: f64,
    pub trees: usize,
    pub species: Vec<SpeciesSlice>,
    pub mean_elevation: Option<f64>,
    pub elevation_samples: usize,
}

impl WardSummary {
    pub fn dominant_species(&self) -> Option<&SpeciesSlice> {
        self.species.iter().max_by_key(|s| s.count)
    }
}

fn base_summary(catalog: &Catalog, ward: &Ward) -> WardSummary {
    let identity = ward_identity(&ward.properties);
    let tree_ids = trees_within(catalog, ward);
    let counts = species_counts(tree_ids.iter().map(|&i| &catalog.trees[i].properties));
    let schools = schools_within(catalog, ward);
    let area_km2 = (area_m2(&ward.geometry) / 1_000_000.0 * 100.0).round() / 100.0;
    let school_density = if schools > 0 && area_km2 > 0.0 {
        schools as f64 / area_km2
    } else {
        0.0
    };

    WardSummary {
        ward_id: ward.id,
        number: identity.number,
        name: identity.name,
        code: present_value(&ward.properties, "KGISWardID"),
        area_km2,
        schools,
        school_density,
        trees: tree_ids.len(),
        species: species_chart(&counts),
        mean_elevation: None,
        elevation_samples: 0,
    }
}

fn elevation_grid(ward: &Ward) -> Vec<Point<f64>> {
    let step = adaptive_step(area_m2(&ward.geometry));
    point_grid(&ward.geometry, step)
}

pub async fn summarize_ward(catalog: &Catalog, ward: &Ward, config: &AnalyticsConfig) -> WardSummary {
    let mut summary = base_summary(catalog, ward);
    if let Some(source) = catalog.elevation.as_deref() {
        let grid = elevation_grid(ward);
        summary.elevation_samples = grid.len();
        summary.mean_elevation = mean_elevation(source, &grid, config.batch_size, config.yield_every).await;
    }
    debug!(ward = ward.id, trees = summary.trees, schools = summary.schools, "ward summarized");
    summary
}

pub fn summarize_ward_blocking(catalog: &Catalog, ward: &Ward) -> WardSummary {
    let mut summary = base_summary(catalog, ward);
    if let Some(source) = catalog.elevation.as_deref() {
        let grid = elevation_grid(ward);
        summary.elevation_samples = grid.len();
        summary.mean_elevation = mean_elevation_blocking(source, &grid);
    }
    summary
}

/// Last computed summary per ward, kept for the life of the process.
#[derive(Default)]
pub struct SummaryCache {
    entries: Mutex<HashMap<usize, Arc<WardSummary>>>,
}

impl SummaryCache {
    pub fn get(&self, ward_id: usize) -> Option<Arc<WardSummary>> {
        self.entries.lock().get(&ward_id).cloned()
    }

    pub async fn get_or_compute(
        &self,
        catalog: &Catalog,
        ward: &Ward,
        config: &AnalyticsConfig,
    ) -> Arc<WardSummary> {
        if let Some(hit) = self.get(ward.id) {
            return hit;
        }
        let summary = Arc::new(summarize_ward(catalog, ward, config).await);
        self.entries.lock().insert(ward.id, summary.clone());
        summary
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::tests::{collection, square_ward};
    use crate::data::CatalogBuilder;
    use crate::elevation::RasterDem;
    use serde_json::json;
    use std::future::Future;
    use std::pin::pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context as TaskContext, Poll, Wake, Waker};

    pub(crate) fn tree(lng: f64, lat: f64, name: &str) -> serde_json::Value {
        json!({
            "type": "Feature",
            "properties": { "TreeName": name, "OBJECTID": 7 },
            "geometry": { "type": "Point", "coordinates": [lng, lat] }
        })
    }

    /// Ward 0 spans 77.50..77.52 / 12.90..12.92 with two Neem and one Peepal
    /// inside; a fourth tree lies outside. One school inside, one outside.
    /// Elevation rises linearly west to east from 900 m to 920 m.
    pub(crate) fn fixture_catalog() -> Catalog {
        let mut builder = CatalogBuilder::new();
        builder.trees("layer1", collection(json!({
            "type": "FeatureCollection",
            "features": [
                tree(77.505, 12.905, "Neem"),
                tree(77.515, 12.915, "Peepal"),
                tree(77.510, 12.910, "Neem"),
                tree(77.600, 12.990, "Rain Tree"),
            ]
        })));
        builder.wards("bbmp", collection(json!({
            "type": "FeatureCollection",
            "features": [square_ward("Test Ward", 77.50, 12.90, 0.02)]
        }))).unwrap();
        builder.schools(collection(json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": { "name": "GHPS Inside" },
                  "geometry": { "type": "Point", "coordinates": [77.51, 12.91] } },
                { "type": "Feature", "properties": { "name": "Outside" },
                  "geometry": { "type": "Point", "coordinates": [77.70, 13.00] } }
            ]
        })));
        let dem = RasterDem::from_grid(2, 1, vec![900.0, 920.0], [77.50, 12.90, 77.52, 12.92]).unwrap();
        builder.elevation(Box::new(dem));
        builder.build(50.0, 14)
    }

    fn props(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn tree_name_falls_back_through_fields() {
        assert_eq!(tree_name(&props(json!({ "TreeName": "Honge" }))), "Honge");
        assert_eq!(tree_name(&props(json!({ "TreeName": "", "type": "Mango" }))), "Mango");
        assert_eq!(tree_name(&props(json!({ "KGISTreeID": 42 }))), "42");
        assert_eq!(tree_name(&props(json!({}))), "Unknown");
    }

    #[test]
    fn ward_identity_prefers_kgis_fields() {
        let id = ward_identity(&props(json!({ "KGISWardNo": 12, "KGISWardName": "Jayanagar" })));
        assert_eq!(id, WardIdentity { number: Some("12".into()), name: "Jayanagar".into() });

        let id = ward_identity(&props(json!({ "ward_no": "88" })));
        assert_eq!(id.name, "Ward #88");

        let id = ward_identity(&props(json!({})));
        assert_eq!(id, WardIdentity { number: None, name: "—".into() });
    }

    #[test]
    fn chart_truncates_labels_and_cycles_colours() {
        let counts: Vec<(String, usize)> = (0..12)
            .map(|i| (format!("Species number {i:02}"), 1))
            .collect();
        let chart = species_chart(&counts);
        assert_eq!(chart[0].label, "Species number ...");
        assert_eq!(chart[0].name, "Species number 00");
        assert_eq!(chart[11].color, PIE_COLORS[0]);
        assert_eq!(chart[1].color, PIE_COLORS[1]);
    }

    #[test]
    fn species_counts_keep_first_seen_order() {
        let a = props(json!({ "TreeName": "Neem" }));
        let b = props(json!({ "TreeName": "Peepal" }));
        let counts = species_counts([&a, &b, &a]);
        assert_eq!(counts, vec![("Neem".to_string(), 2), ("Peepal".to_string(), 1)]);
        let chart = species_chart(&counts);
        assert_eq!(chart[0].percentage, 66.7);
        assert_eq!(chart[1].percentage, 33.3);
    }

    #[test]
    fn adaptive_step_thresholds() {
        assert_eq!(adaptive_step(999_999.0), 150.0);
        assert_eq!(adaptive_step(1_000_000.0), 250.0);
        assert_eq!(adaptive_step(4_999_999.0), 250.0);
        assert_eq!(adaptive_step(5_000_000.0), 350.0);
    }

    #[test]
    fn grid_points_stay_strictly_inside() {
        let catalog = fixture_catalog();
        let ward = catalog.ward(0).unwrap();
        let grid = point_grid(&ward.geometry, 500.0);
        // ~2.17 km x 2.2 km square at 500 m spacing
        assert!(grid.len() >= 9 && grid.len() <= 25, "got {} points", grid.len());
        assert!(grid.iter().all(|p| ward.geometry.contains(p)));
    }

    #[test]
    fn degenerate_geometry_yields_empty_grid() {
        let flat = MultiPolygon::new(vec![]);
        assert!(point_grid(&flat, 150.0).is_empty());
    }

    #[test]
    fn counts_points_inside_ward() {
        let catalog = fixture_catalog();
        let ward = catalog.ward(0).unwrap();
        assert_eq!(trees_within(&catalog, ward), vec![0, 1, 2]);
        assert_eq!(schools_within(&catalog, ward), 1);
    }

    #[tokio::test]
    async fn summary_combines_counts_area_and_elevation() {
        let catalog = fixture_catalog();
        let ward = catalog.ward(0).unwrap();
        let summary = summarize_ward(&catalog, ward, &AnalyticsConfig::default()).await;

        assert_eq!(summary.name, "Test Ward");
        assert_eq!(summary.trees, 3);
        assert_eq!(summary.schools, 1);
        assert_eq!(summary.species[0].name, "Neem");
        assert_eq!(summary.species[0].count, 2);
        assert_eq!(summary.dominant_species().map(|s| s.name.as_str()), Some("Neem"));
        // 0.02° square near 12.9°N is roughly 4.7 km²
        assert!(summary.area_km2 > 4.5 && summary.area_km2 < 5.0, "area {}", summary.area_km2);
        assert!((summary.school_density - 1.0 / summary.area_km2).abs() < 1e-9);

        let mean = summary.mean_elevation.expect("mean elevation");
        assert!(mean > 900.0 && mean < 920.0, "mean {mean}");
        assert!(summary.elevation_samples > 0);

        let blocking = summarize_ward_blocking(&catalog, ward);
        assert_eq!(blocking, summary);
    }

    #[tokio::test]
    async fn no_dem_means_no_elevation() {
        let mut catalog = fixture_catalog();
        catalog.elevation = None;
        let ward = catalog.ward(0).unwrap().clone();
        let summary = summarize_ward(&catalog, &ward, &AnalyticsConfig::default()).await;
        assert_eq!(summary.mean_elevation, None);
        assert_eq!(summary.elevation_samples, 0);
    }

    #[tokio::test]
    async fn mean_skips_points_without_elevation() {
        let dem = RasterDem::from_grid(1, 1, vec![100.0], [0.0, 0.0, 1.0, 1.0]).unwrap();
        let points = vec![Point::new(0.5, 0.5), Point::new(5.0, 5.0), Point::new(0.25, 0.75)];
        assert_eq!(mean_elevation(&dem, &points, 1, 1).await, Some(100.0));
        assert_eq!(mean_elevation(&dem, &[Point::new(9.0, 9.0)], 50, 10).await, None);
    }

    struct WakeCounter(AtomicUsize);

    impl Wake for WakeCounter {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Polls to completion on the current thread, returning the output and the
    /// number of times the future gave control back.
    fn poll_counting_yields<F: Future>(future: F) -> (F::Output, usize, usize) {
        let counter = Arc::new(WakeCounter(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = TaskContext::from_waker(&waker);
        let mut future = pin!(future);
        let mut pending = 0;
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(output) => return (output, pending, counter.0.load(Ordering::SeqCst)),
                Poll::Pending => pending += 1,
            }
        }
    }

    #[test]
    fn mean_elevation_yields_once_per_batch_group() {
        let dem = RasterDem::from_grid(1, 1, vec![100.0], [0.0, 0.0, 1.0, 1.0]).unwrap();
        // 21 batches of 50: yields after batches 1, 11 and 21
        let points = vec![Point::new(0.5, 0.5); 1050];
        let (mean, pending, wakes) = poll_counting_yields(mean_elevation(&dem, &points, 50, 10));
        assert_eq!(mean, Some(100.0));
        assert_eq!(pending, 3);
        assert_eq!(wakes, pending);

        // 10 batches stay within a single group
        let (_, pending, _) = poll_counting_yields(mean_elevation(&dem, &points[..500], 50, 10));
        assert_eq!(pending, 1);

        let (_, pending, _) = poll_counting_yields(mean_elevation(&dem, &points[..120], 50, 1));
        assert_eq!(pending, 3);
    }

    #[test]
    fn blocking_mean_never_yields() {
        let dem = RasterDem::from_grid(1, 1, vec![100.0], [0.0, 0.0, 1.0, 1.0]).unwrap();
        let points = vec![Point::new(0.5, 0.5); 600];
        assert_eq!(mean_elevation_blocking(&dem, &points), Some(100.0));
    }

    #[tokio::test]
    async fn cache_returns_the_first_result() {
        let catalog = fixture_catalog();
        let ward = catalog.ward(0).unwrap();
        let cache = SummaryCache::default();
        assert!(cache.is_empty());
        let first = cache.get_or_compute(&catalog, ward, &AnalyticsConfig::default()).await;
        let second = cache.get_or_compute(&catalog, ward, &AnalyticsConfig::default()).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }
}
