//! Radius clustering of school points, one level per integer zoom.
//!
//! At every zoom up to `max_zoom` points are merged greedily with their
//! unassigned neighbours inside `radius` screen pixels. Above `max_zoom`
//! every point is shown on its own.

use crate::projection::{lng_lat_to_unit, pixel_envelope, unit_to_lng_lat, world_size};
use geo::Point;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::Serialize;

type IndexedPoint = GeomWithData<[f64; 2], usize>;

#[derive(Debug, Clone, Serialize)]
pub struct ClusterNode {
    pub id: u64,
    pub zoom: u8,
    /// Mean position of the members, `[lng, lat]`.
    pub center: [f64; 2],
    /// Indices into the clustered point list, ascending.
    pub members: Vec<usize>,
}

impl ClusterNode {
    pub fn point_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_cluster(&self) -> bool {
        self.members.len() > 1
    }
}

struct Level {
    nodes: Vec<ClusterNode>,
    /// node index for every input point
    assignment: Vec<usize>,
    index: RTree<IndexedPoint>,
}

pub struct ClusterIndex {
    radius: f64,
    max_zoom: u8,
    levels: Vec<Level>,
}

fn encode_id(zoom: u8, index: usize) -> u64 {
    ((index as u64) << 5) | zoom as u64
}

fn decode_id(id: u64) -> (u8, usize) {
    ((id & 0x1f) as u8, (id >> 5) as usize)
}

impl ClusterIndex {
    pub fn build(points: &[Point<f64>], radius: f64, max_zoom: u8) -> Self {
        let units: Vec<[f64; 2]> = points
            .iter()
            .map(|p| {
                let (x, y) = lng_lat_to_unit(p.x(), p.y());
                [x, y]
            })
            .collect();
        let unit_tree = RTree::bulk_load(
            units.iter().enumerate().map(|(i, u)| IndexedPoint::new(*u, i)).collect(),
        );

        let levels = (0..=max_zoom)
            .map(|zoom| Self::build_level(&units, &unit_tree, radius, zoom))
            .collect();

        Self { radius, max_zoom, levels }
    }

    fn build_level(units: &[[f64; 2]], tree: &RTree<IndexedPoint>, radius: f64, zoom: u8) -> Level {
        let r = radius / world_size(zoom as f64);
        let mut assignment = vec![usize::MAX; units.len()];
        let mut nodes = Vec::new();

        for (i, unit) in units.iter().enumerate() {
            if assignment[i] != usize::MAX {
                continue;
            }
            let node_index = nodes.len();
            let mut members: Vec<usize> = tree
                .locate_within_distance(*unit, r * r)
                .map(|p| p.data)
                .filter(|&j| assignment[j] == usize::MAX)
                .collect();
            members.sort_unstable();
            for &j in &members {
                assignment[j] = node_index;
            }

            let n = members.len() as f64;
            let (sx, sy) = members
                .iter()
                .fold((0.0, 0.0), |(sx, sy), &j| (sx + units[j][0], sy + units[j][1]));
            let (lng, lat) = unit_to_lng_lat(sx / n, sy / n);
            nodes.push(ClusterNode {
                id: encode_id(zoom, node_index),
                zoom,
                center: [lng, lat],
                members,
            });
        }

        let index = RTree::bulk_load(
            nodes.iter().enumerate().map(|(i, n)| IndexedPoint::new(n.center, i)).collect(),
        );
        Level { nodes, assignment, index }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    /// Level shown at a fractional map zoom, `None` above the clustering range.
    fn level_for(&self, zoom: f64) -> Option<&Level> {
        let z = zoom.max(0.0).floor();
        if z > self.max_zoom as f64 {
            return None;
        }
        self.levels.get(z as usize)
    }

    pub fn node(&self, id: u64) -> Option<&ClusterNode> {
        let (zoom, index) = decode_id(id);
        self.levels.get(zoom as usize)?.nodes.get(index)
    }

    /// Nodes displayed at `zoom` whose centre falls within `radius_px` pixels
    /// of the envelope around the click. Callers refine with an exact test.
    pub fn nodes_near(&self, lng: f64, lat: f64, zoom: f64, radius_px: f64) -> Vec<&ClusterNode> {
        let Some(level) = self.level_for(zoom) else {
            return Vec::new();
        };
        let envelope: AABB<[f64; 2]> = pixel_envelope(lng, lat, zoom, radius_px);
        level
            .index
            .locate_in_envelope(&envelope)
            .map(|p| &level.nodes[p.data])
            .collect()
    }

    /// `true` when point `index` is drawn on its own at `zoom`.
    pub fn is_unclustered(&self, index: usize, zoom: f64) -> bool {
        match self.level_for(zoom) {
            None => true,
            Some(level) => level
                .assignment
                .get(index)
                .map(|&n| !level.nodes[n].is_cluster())
                .unwrap_or(false),
        }
    }

    /// Smallest zoom at which the members no longer share one node,
    /// `max_zoom + 1` if they stay together on every clustered level.
    pub fn expansion_zoom(&self, id: u64) -> Option<u8> {
        let node = self.node(id)?;
        let first = *node.members.first()?;
        for zoom in node.zoom + 1..=self.max_zoom {
            let level = &self.levels[zoom as usize];
            let holder = level.assignment[first];
            if node.members.iter().any(|&m| level.assignment[m] != holder) {
                return Some(zoom);
            }
        }
        Some(self.max_zoom.saturating_add(1))
    }
}

/// Short label for a cluster bubble: `950`, `1.2k`, `12k`.
pub fn abbreviate_count(count: usize) -> String {
    if count >= 10_000 {
        format!("{}k", (count as f64 / 1000.0).round())
    } else if count >= 1000 {
        format!("{}k", (count as f64 / 100.0).round() / 10.0)
    } else {
        count.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> Vec<Point<f64>> {
        vec![
            Point::new(77.5900, 12.9700),
            Point::new(77.5902, 12.9701),
            Point::new(77.5904, 12.9702),
            Point::new(77.7000, 13.0500),
        ]
    }

    #[test]
    fn nearby_points_merge_at_low_zoom() {
        let index = ClusterIndex::build(&points(), 50.0, 14);
        let near = index.nodes_near(77.5902, 12.9701, 10.0, 60.0);
        let cluster = near.iter().find(|n| n.is_cluster()).expect("cluster at z10");
        assert_eq!(cluster.point_count(), 3);
        assert_eq!(cluster.members, vec![0, 1, 2]);
        assert!(index.is_unclustered(3, 10.0));
        assert!(!index.is_unclustered(0, 10.0));
    }

    #[test]
    fn points_stand_alone_above_max_zoom() {
        let index = ClusterIndex::build(&points(), 50.0, 14);
        assert!(index.is_unclustered(0, 15.0));
        assert!(index.nodes_near(77.5902, 12.9701, 15.0, 60.0).is_empty());
    }

    #[test]
    fn expansion_zoom_splits_the_cluster() {
        let index = ClusterIndex::build(&points(), 50.0, 14);
        let cluster = index
            .nodes_near(77.5902, 12.9701, 8.0, 60.0)
            .into_iter()
            .find(|n| n.is_cluster())
            .cloned()
            .expect("cluster at z8");
        let zoom = index.expansion_zoom(cluster.id).unwrap();
        assert!(zoom > 8);
        for z in 9..zoom.min(index.max_zoom() + 1) {
            assert!(index.members_together(&cluster.members, z), "split early at z{z}");
        }
        if zoom <= index.max_zoom() {
            assert!(!index.members_together(&cluster.members, zoom));
        }
    }

    impl ClusterIndex {
        fn members_together(&self, members: &[usize], zoom: u8) -> bool {
            let level = &self.levels[zoom as usize];
            members.iter().all(|&m| level.assignment[m] == level.assignment[members[0]])
        }
    }

    #[test]
    fn expansion_detects_split_when_first_member_joins_an_equal_sized_node() {
        // Along one parallel, in multiples of the z10 cluster radius:
        // 0 and 1 merge at z10, 2 and 3 form the cluster under test.
        // At z11 point 1 seeds and takes 2, leaving 3 alone.
        let u = 50.0 * 360.0 / world_size(10.0);
        let pts: Vec<Point<f64>> = [0.0, 0.9, 1.3, 2.2]
            .iter()
            .map(|k| Point::new(77.5 + k * u, 12.97))
            .collect();
        let index = ClusterIndex::build(&pts, 50.0, 14);

        let cluster = index.levels[10]
            .nodes
            .iter()
            .find(|n| n.members == vec![2, 3])
            .cloned()
            .expect("cluster of points 2 and 3 at z10");
        let level = &index.levels[11];
        assert_eq!(level.nodes[level.assignment[2]].members, vec![1, 2]);

        assert_eq!(index.expansion_zoom(cluster.id), Some(11));
    }

    #[test]
    fn coincident_points_expand_past_deepest_level() {
        let pts = vec![Point::new(77.59, 12.97), Point::new(77.59, 12.97)];
        let index = ClusterIndex::build(&pts, 50.0, 24);
        let node = &index.levels[24].nodes[0];
        assert_eq!(node.members, vec![0, 1]);
        assert_eq!(index.expansion_zoom(node.id), Some(25));
        assert_eq!(index.expansion_zoom(index.levels[3].nodes[0].id), Some(25));
    }

    #[test]
    fn ids_round_trip() {
        let index = ClusterIndex::build(&points(), 50.0, 14);
        let node = &index.levels[12].nodes[0];
        assert_eq!(index.node(node.id).map(|n| n.zoom), Some(12));
        assert_eq!(decode_id(encode_id(7, 41)), (7, 41));
    }

    #[test]
    fn abbreviates_like_the_map_labels() {
        assert_eq!(abbreviate_count(950), "950");
        assert_eq!(abbreviate_count(1234), "1.2k");
        assert_eq!(abbreviate_count(12_600), "13k");
    }
}
