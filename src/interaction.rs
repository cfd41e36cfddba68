//! Click handling: find the top-priority feature under a screen position and
//! turn it into something the client can show.

use crate::analytics::{SummaryCache, WardSummary};
use crate::cluster::abbreviate_count;
use crate::config::{AppConfig, DatasetKind};
use crate::data::Catalog;
use crate::popup::PopupRenderer;
use crate::projection::{pixel_distance, pixel_envelope};
use crate::style::{
    fill_layer_id, interpolate, point_layer_id, step, CLUSTER_RADIUS_BASE, CLUSTER_RADIUS_STEPS,
    SCHOOLS_SOURCE, SCHOOLS_UNCLUSTERED, SCHOOL_CLUSTERS, SCHOOL_RADIUS_STOPS, SCHOOL_STROKE,
    TREE_RADIUS_STOPS, TREE_STROKE,
};
use anyhow::Result;
use geo::{Intersects, Point};
use rstar::AABB;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Zoom cap applied when expanding a cluster.
pub const MAX_EXPANSION_ZOOM: f64 = 18.0;

#[derive(Debug, Clone)]
pub struct ClickQuery {
    pub lng: f64,
    pub lat: f64,
    pub zoom: f64,
    /// Toggle group ids currently switched off.
    pub hidden: HashSet<String>,
}

impl ClickQuery {
    pub fn new(lng: f64, lat: f64, zoom: f64) -> Self {
        Self { lng, lat, zoom, hidden: HashSet::new() }
    }

    fn position(&self) -> [f64; 2] {
        [self.lng, self.lat]
    }
}

/// The feature that won the priority lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Hit {
    Cluster { id: u64 },
    School { index: usize },
    Tree { index: usize },
    Ward { id: usize },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dispatch {
    ClusterExpansion {
        layer: String,
        cluster_id: u64,
        point_count: usize,
        point_count_abbreviated: String,
        center: [f64; 2],
        zoom: f64,
    },
    School {
        layer: String,
        index: usize,
        coordinates: [f64; 2],
        html: String,
    },
    Tree {
        layer: String,
        dataset: String,
        index: usize,
        coordinates: [f64; 2],
        html: String,
    },
    Ward {
        layer: String,
        ward_id: usize,
        coordinates: [f64; 2],
        summary: Arc<WardSummary>,
        html: String,
    },
    Elevation {
        coordinates: [f64; 2],
        elevation: f64,
        html: String,
    },
    Nothing,
}

/// Closest point within `radius_px` (circle plus stroke) of the click.
fn nearest_point<I>(candidates: I, query: &ClickQuery, radius_px: f64) -> Option<usize>
where
    I: Iterator<Item = (usize, [f64; 2])>,
{
    candidates
        .map(|(i, pos)| (i, pixel_distance(pos, query.position(), query.zoom)))
        .filter(|(_, d)| *d <= radius_px)
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(i, _)| i)
}

pub struct Dispatcher<'a> {
    pub config: &'a AppConfig,
    pub catalog: &'a Catalog,
    pub popups: &'a PopupRenderer,
    pub summaries: &'a SummaryCache,
}

impl<'a> Dispatcher<'a> {
    fn hit_school_cluster(&self, query: &ClickQuery) -> Option<Hit> {
        let clusters = self.catalog.school_clusters.as_ref()?;
        let max_radius = CLUSTER_RADIUS_STEPS.last().map(|s| s.1).unwrap_or(CLUSTER_RADIUS_BASE) + SCHOOL_STROKE;
        clusters
            .nodes_near(query.lng, query.lat, query.zoom, max_radius)
            .into_iter()
            .filter(|n| n.is_cluster())
            .filter_map(|n| {
                let radius = step(CLUSTER_RADIUS_BASE, &CLUSTER_RADIUS_STEPS, n.point_count() as f64) + SCHOOL_STROKE;
                let d = pixel_distance(n.center, query.position(), query.zoom);
                (d <= radius).then_some((n.id, d))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| Hit::Cluster { id })
    }

    fn hit_school(&self, query: &ClickQuery) -> Option<Hit> {
        let clusters = self.catalog.school_clusters.as_ref()?;
        let radius = interpolate(&SCHOOL_RADIUS_STOPS, query.zoom) + SCHOOL_STROKE;
        let envelope: AABB<[f64; 2]> = pixel_envelope(query.lng, query.lat, query.zoom, radius);
        let candidates = self.catalog.school_index
            .locate_in_envelope(&envelope)
            .filter(|p| clusters.is_unclustered(p.data, query.zoom))
            .map(|p| (p.data, *p.geom()));
        nearest_point(candidates, query, radius).map(|index| Hit::School { index })
    }

    fn hit_tree(&self, dataset: &str, query: &ClickQuery) -> Option<Hit> {
        let radius = interpolate(&TREE_RADIUS_STOPS, query.zoom) + TREE_STROKE;
        let envelope: AABB<[f64; 2]> = pixel_envelope(query.lng, query.lat, query.zoom, radius);
        let candidates = self.catalog.tree_index
            .locate_in_envelope(&envelope)
            .filter(|p| self.catalog.trees[p.data].dataset == dataset)
            .map(|p| (p.data, *p.geom()));
        nearest_point(candidates, query, radius).map(|index| Hit::Tree { index })
    }

    fn hit_ward(&self, query: &ClickQuery) -> Option<Hit> {
        let point = Point::new(query.lng, query.lat);
        let envelope = AABB::from_point(query.position());
        self.catalog.ward_index
            .locate_in_envelope_intersecting(&envelope)
            .map(|w| w.index)
            .filter(|&id| {
                self.catalog.ward(id)
                    .map(|ward| ward.geometry.intersects(&point))
                    .unwrap_or(false)
            })
            .min()
            .map(|id| Hit::Ward { id })
    }

    /// Walks the interactive layers in priority order and returns the first
    /// hit together with the layer id it was found on.
    pub fn hit_test(&self, query: &ClickQuery) -> Option<(String, Hit)> {
        let schools_visible = !query.hidden.contains(SCHOOLS_SOURCE) && self.catalog.schools.is_some();
        if schools_visible {
            if let Some(hit) = self.hit_school_cluster(query) {
                return Some((SCHOOL_CLUSTERS.to_string(), hit));
            }
            if let Some(hit) = self.hit_school(query) {
                return Some((SCHOOLS_UNCLUSTERED.to_string(), hit));
            }
        }

        let visible = |id: &str| !query.hidden.contains(id) && self.catalog.collections.contains_key(id);

        for dataset in &self.config.input.datasets {
            if dataset.kind != DatasetKind::Trees || !visible(&dataset.id) {
                continue;
            }
            if let Some(hit) = self.hit_tree(&dataset.id, query) {
                return Some((point_layer_id(&dataset.id), hit));
            }
        }

        let wards = self.config.ward_dataset().filter(|d| visible(&d.id))?;
        self.hit_ward(query).map(|hit| (fill_layer_id(&wards.id), hit))
    }

    pub async fn dispatch(&self, query: &ClickQuery) -> Result<Dispatch> {
        let Some((layer, hit)) = self.hit_test(query) else {
            return self.elevation_at_click(query);
        };

        let dispatch = match hit {
            Hit::Cluster { id } => {
                let clusters = self.catalog.school_clusters.as_ref();
                match (clusters.and_then(|c| c.node(id)), clusters.and_then(|c| c.expansion_zoom(id))) {
                    (Some(node), Some(zoom)) => Dispatch::ClusterExpansion {
                        layer,
                        cluster_id: id,
                        point_count: node.point_count(),
                        point_count_abbreviated: abbreviate_count(node.point_count()),
                        center: node.center,
                        zoom: (zoom as f64).min(MAX_EXPANSION_ZOOM),
                    },
                    _ => Dispatch::Nothing,
                }
            }
            Hit::School { index } => {
                let Some(school) = self.catalog.schools.as_ref().and_then(|s| s.get(index)) else {
                    return Ok(Dispatch::Nothing);
                };
                Dispatch::School {
                    layer,
                    index,
                    coordinates: [school.point.x(), school.point.y()],
                    html: self.popups.school(&school.properties)?,
                }
            }
            Hit::Tree { index } => {
                let tree = &self.catalog.trees[index];
                Dispatch::Tree {
                    layer,
                    dataset: tree.dataset.clone(),
                    index,
                    coordinates: [tree.point.x(), tree.point.y()],
                    html: self.popups.tree(&tree.properties)?,
                }
            }
            Hit::Ward { id } => {
                let Some(ward) = self.catalog.ward(id) else {
                    return Ok(Dispatch::Nothing);
                };
                let summary = self.summaries
                    .get_or_compute(self.catalog, ward, &self.config.analytics)
                    .await;
                let html = self.popups.ward(&summary)?;
                Dispatch::Ward {
                    layer,
                    ward_id: id,
                    coordinates: query.position(),
                    summary,
                    html,
                }
            }
        };
        Ok(dispatch)
    }

    fn elevation_at_click(&self, query: &ClickQuery) -> Result<Dispatch> {
        let elevation = self.catalog.elevation
            .as_deref()
            .and_then(|source| source.elevation_at(query.lng, query.lat))
            .filter(|z| z.is_finite());
        match elevation {
            Some(z) => Ok(Dispatch::Elevation {
                coordinates: query.position(),
                elevation: z,
                html: self.popups.elevation(z)?,
            }),
            None => Ok(Dispatch::Nothing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::tests::{fixture_catalog, tree};
    use crate::config::sample_config;
    use crate::data::tests::collection;
    use crate::data::CatalogBuilder;
    use serde_json::json;

    struct Fixture {
        config: AppConfig,
        catalog: Catalog,
        popups: PopupRenderer,
        summaries: SummaryCache,
    }

    impl Fixture {
        fn new(catalog: Catalog) -> Self {
            Self {
                config: sample_config(),
                catalog,
                popups: PopupRenderer::new().unwrap(),
                summaries: SummaryCache::default(),
            }
        }

        fn dispatcher(&self) -> Dispatcher<'_> {
            Dispatcher {
                config: &self.config,
                catalog: &self.catalog,
                popups: &self.popups,
                summaries: &self.summaries,
            }
        }
    }

    #[test]
    fn school_wins_over_tree_and_ward() {
        let fx = Fixture::new(fixture_catalog());
        // the school at 77.51,12.91 sits inside the ward, next to a tree
        let (layer, hit) = fx.dispatcher().hit_test(&ClickQuery::new(77.51, 12.91, 16.0)).unwrap();
        assert_eq!(layer, SCHOOLS_UNCLUSTERED);
        assert_eq!(hit, Hit::School { index: 0 });
    }

    #[test]
    fn hidden_schools_fall_through_to_trees() {
        let fx = Fixture::new(fixture_catalog());
        let mut query = ClickQuery::new(77.51, 12.91, 16.0);
        query.hidden.insert("schools".to_string());
        let (layer, hit) = fx.dispatcher().hit_test(&query).unwrap();
        assert_eq!(layer, "layer1-point");
        assert_eq!(hit, Hit::Tree { index: 2 });
    }

    #[test]
    fn ward_is_the_lowest_priority() {
        let fx = Fixture::new(fixture_catalog());
        let (layer, hit) = fx.dispatcher().hit_test(&ClickQuery::new(77.502, 12.918, 16.0)).unwrap();
        assert_eq!(layer, "bbmp-fill");
        assert_eq!(hit, Hit::Ward { id: 0 });

        let mut query = ClickQuery::new(77.502, 12.918, 16.0);
        query.hidden.insert("bbmp".to_string());
        assert!(fx.dispatcher().hit_test(&query).is_none());
    }

    #[tokio::test]
    async fn ward_after_skipped_feature_is_clickable() {
        let mut builder = CatalogBuilder::new();
        builder.wards("bbmp", collection(json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": {},
                  "geometry": { "type": "Point", "coordinates": [77.6, 12.9] } },
                crate::data::tests::square_ward("Only Ward", 77.50, 12.90, 0.02)
            ]
        }))).unwrap();
        let fx = Fixture::new(builder.build(50.0, 14));

        let query = ClickQuery::new(77.51, 12.91, 14.0);
        assert_eq!(fx.dispatcher().hit_test(&query).map(|h| h.1), Some(Hit::Ward { id: 1 }));

        match fx.dispatcher().dispatch(&query).await.unwrap() {
            Dispatch::Ward { ward_id, summary, .. } => {
                assert_eq!(ward_id, 1);
                assert_eq!(summary.ward_id, 1);
                assert_eq!(summary.name, "Only Ward");
            }
            other => panic!("expected ward, got {other:?}"),
        }
        assert!(fx.summaries.get(1).is_some());
        assert!(fx.summaries.get(0).is_none());
    }

    #[test]
    fn tree_hit_respects_rendered_radius() {
        let fx = Fixture::new(fixture_catalog());
        let mut query = ClickQuery::new(77.6001, 12.9900, 18.0);
        query.hidden.insert("bbmp".to_string());
        // ~0.0001° is ~37 px at z18, well outside an 8 px circle
        assert!(fx.dispatcher().hit_test(&query).is_none());
        query.lng = 77.600001;
        assert_eq!(fx.dispatcher().hit_test(&query).map(|h| h.1), Some(Hit::Tree { index: 3 }));
    }

    #[test]
    fn dense_schools_form_a_cluster_at_low_zoom() {
        let mut builder = CatalogBuilder::new();
        let features: Vec<_> = (0..12)
            .map(|i| json!({
                "type": "Feature",
                "properties": { "name": format!("School {i}") },
                "geometry": { "type": "Point", "coordinates": [77.59 + i as f64 * 0.0001, 12.97] }
            }))
            .collect();
        builder.schools(collection(json!({ "type": "FeatureCollection", "features": features })));
        let fx = Fixture::new(builder.build(50.0, 14));

        let (layer, hit) = fx.dispatcher().hit_test(&ClickQuery::new(77.5905, 12.97, 11.0)).unwrap();
        assert_eq!(layer, SCHOOL_CLUSTERS);
        assert!(matches!(hit, Hit::Cluster { .. }));
    }

    #[tokio::test]
    async fn cluster_click_returns_expansion() {
        let mut builder = CatalogBuilder::new();
        builder.schools(collection(json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [77.590, 12.97] } },
                { "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [77.591, 12.97] } }
            ]
        })));
        let fx = Fixture::new(builder.build(50.0, 14));
        let dispatch = fx.dispatcher().dispatch(&ClickQuery::new(77.5905, 12.97, 10.0)).await.unwrap();
        match dispatch {
            Dispatch::ClusterExpansion { point_count, zoom, .. } => {
                assert_eq!(point_count, 2);
                assert!(zoom > 10.0 && zoom <= MAX_EXPANSION_ZOOM);
            }
            other => panic!("expected cluster expansion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ward_click_computes_and_caches_summary() {
        let fx = Fixture::new(fixture_catalog());
        let dispatch = fx.dispatcher().dispatch(&ClickQuery::new(77.502, 12.918, 16.0)).await.unwrap();
        match dispatch {
            Dispatch::Ward { ward_id, summary, html, .. } => {
                assert_eq!(ward_id, 0);
                assert_eq!(summary.trees, 3);
                assert!(html.contains("Test Ward"));
            }
            other => panic!("expected ward, got {other:?}"),
        }
        assert!(fx.summaries.get(0).is_some());
    }

    #[tokio::test]
    async fn empty_spot_reports_elevation() {
        let mut builder = CatalogBuilder::new();
        builder.trees("layer1", collection(json!({
            "type": "FeatureCollection",
            "features": [tree(77.515, 12.915, "Peepal")]
        })));
        let dem = crate::elevation::RasterDem::from_grid(1, 1, vec![910.0], [77.50, 12.90, 77.52, 12.92]).unwrap();
        builder.elevation(Box::new(dem));
        let fx = Fixture::new(builder.build(50.0, 14));

        let dispatch = fx.dispatcher().dispatch(&ClickQuery::new(77.505, 12.905, 16.0)).await.unwrap();
        match dispatch {
            Dispatch::Elevation { elevation, html, .. } => {
                assert_eq!(elevation, 910.0);
                assert!(html.contains("910.0 m"));
            }
            other => panic!("expected elevation, got {other:?}"),
        }

        // outside the DEM nothing is shown
        let dispatch = fx.dispatcher().dispatch(&ClickQuery::new(78.0, 13.5, 16.0)).await.unwrap();
        assert!(matches!(dispatch, Dispatch::Nothing));
    }

    #[test]
    fn dispatch_serializes_with_kind_tag() {
        let value = serde_json::to_value(Dispatch::Nothing).unwrap();
        assert_eq!(value, json!({ "kind": "nothing" }));
    }
}
