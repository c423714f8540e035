// map — walkable-area membership for the localization constraint
//
// The walkable area is a set of closed polygons in map units, loaded
// from the asset pipeline's walkable.json, with an axis-aligned
// bounding box as the configured fallback and a permissive default when
// neither exists. Polygons are indexed by envelope in an R-tree so the
// per-particle membership test only ray-casts nearby candidates.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use geo::{Coord, Rect};
use rstar::{RTree, RTreeObject, AABB};
use serde::Deserialize;

/// Guards the crossing-parameter division on degenerate (near
/// horizontal) edges.
const EDGE_EPSILON: f64 = 1e-12;

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("I/O error reading walkable map: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed walkable map JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("polygon {0} has fewer than 3 vertices")]
    DegeneratePolygon(usize),

    #[error("non-finite vertex in polygon {0}")]
    NonFiniteVertex(usize),
}

/// Polygon ring with its spatial-index envelope.
#[derive(Clone, Debug)]
struct IndexedPolygon {
    /// Closed ring: first vertex repeated at the end.
    ring: Vec<Coord<f64>>,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedPolygon {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// On-disk schema: `{"polygons": [[[x, y], ...], ...]}` with unclosed
/// rings, as emitted by the SVG conversion tool.
#[derive(Deserialize)]
struct WalkableFile {
    polygons: Vec<Vec<[f64; 2]>>,
}

/// Immutable walkable-area membership test.
pub struct WalkableArea {
    tree: RTree<IndexedPolygon>,
    polygon_count: usize,
    bounds: Option<Rect<f64>>,
}

impl WalkableArea {
    /// No geometry configured: every point is walkable.
    pub fn permissive() -> Self {
        Self { tree: RTree::new(), polygon_count: 0, bounds: None }
    }

    /// Bounding-box-only membership.
    pub fn from_bounds(bounds: Rect<f64>) -> Self {
        Self { tree: RTree::new(), polygon_count: 0, bounds: Some(bounds) }
    }

    /// Build from polygon vertex lists (open or closed rings accepted).
    pub fn from_polygons(polygons: Vec<Vec<(f64, f64)>>) -> Result<Self, MapError> {
        let mut indexed = Vec::with_capacity(polygons.len());
        for (i, vertices) in polygons.into_iter().enumerate() {
            indexed.push(build_polygon(i, vertices)?);
        }
        let polygon_count = indexed.len();
        Ok(Self {
            tree: RTree::bulk_load(indexed),
            polygon_count,
            bounds: None,
        })
    }

    /// Load `walkable.json` produced by the asset pipeline.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let file = File::open(path.as_ref())?;
        let parsed: WalkableFile = serde_json::from_reader(BufReader::new(file))?;
        let polygons = parsed
            .polygons
            .into_iter()
            .map(|ring| ring.into_iter().map(|[x, y]| (x, y)).collect())
            .collect();
        let area = Self::from_polygons(polygons)?;
        log::info!(
            "walkable map loaded: {} polygon(s) from {}",
            area.polygon_count,
            path.as_ref().display()
        );
        Ok(area)
    }

    pub fn polygon_count(&self) -> usize {
        self.polygon_count
    }

    /// True if the point is walkable.
    ///
    /// Polygons win over the bounding box; with neither configured the
    /// test is permissive. Stateless and reentrant.
    pub fn is_inside(&self, x: f64, y: f64) -> bool {
        if self.polygon_count > 0 {
            let probe = AABB::from_point([x, y]);
            return self
                .tree
                .locate_in_envelope_intersecting(&probe)
                .any(|poly| ray_cast(&poly.ring, x, y));
        }
        if let Some(bounds) = &self.bounds {
            let (min, max) = (bounds.min(), bounds.max());
            return x >= min.x && x <= max.x && y >= min.y && y <= max.y;
        }
        true
    }
}

fn build_polygon(index: usize, vertices: Vec<(f64, f64)>) -> Result<IndexedPolygon, MapError> {
    let mut ring: Vec<Coord<f64>> = vertices
        .into_iter()
        .map(|(x, y)| Coord { x, y })
        .collect();
    // Accept closed input rings
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return Err(MapError::DegeneratePolygon(index));
    }
    if ring.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(MapError::NonFiniteVertex(index));
    }
    let first = ring[0];
    ring.push(first);

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for c in &ring {
        min_x = min_x.min(c.x);
        min_y = min_y.min(c.y);
        max_x = max_x.max(c.x);
        max_y = max_y.max(c.y);
    }

    Ok(IndexedPolygon {
        ring,
        envelope: AABB::from_corners([min_x, min_y], [max_x, max_y]),
    })
}

/// Crossing-count test: cast a horizontal ray toward +x and toggle on
/// every edge crossing. Odd count means inside.
fn ray_cast(ring: &[Coord<f64>], x: f64, y: f64) -> bool {
    let mut inside = false;
    for edge in ring.windows(2) {
        let (a, b) = (edge[0], edge[1]);
        if (a.y > y) != (b.y > y) {
            let t = (y - a.y) / (b.y - a.y + EDGE_EPSILON);
            let x_cross = a.x + t * (b.x - a.x);
            if x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> WalkableArea {
        WalkableArea::from_polygons(vec![vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]])
            .unwrap()
    }

    #[test]
    fn test_unit_square_membership() {
        let area = unit_square();
        assert!(area.is_inside(0.5, 0.5));
        assert!(!area.is_inside(2.0, 2.0));
        assert!(!area.is_inside(-0.1, 0.5));
        assert!(!area.is_inside(0.5, -0.1));
    }

    #[test]
    fn test_boundary_resolves_consistently() {
        // The crossing rule puts the left edge inside and the right
        // edge outside; what matters is that repeated queries agree.
        let area = unit_square();
        let on_left = area.is_inside(0.0, 0.5);
        let on_right = area.is_inside(1.0, 0.5);
        assert_eq!(on_left, area.is_inside(0.0, 0.5));
        assert_eq!(on_right, area.is_inside(1.0, 0.5));
        assert_ne!(on_left, on_right);
    }

    #[test]
    fn test_closed_input_ring_accepted() {
        let area = WalkableArea::from_polygons(vec![vec![
            (0.0, 0.0),
            (1.0, 0.0),
            (1.0, 1.0),
            (0.0, 1.0),
            (0.0, 0.0),
        ]])
        .unwrap();
        assert!(area.is_inside(0.5, 0.5));
        assert!(!area.is_inside(1.5, 0.5));
    }

    #[test]
    fn test_concave_polygon() {
        // L-shape: the notch is outside
        let area = WalkableArea::from_polygons(vec![vec![
            (0.0, 0.0),
            (2.0, 0.0),
            (2.0, 1.0),
            (1.0, 1.0),
            (1.0, 2.0),
            (0.0, 2.0),
        ]])
        .unwrap();
        assert!(area.is_inside(0.5, 1.5));
        assert!(area.is_inside(1.5, 0.5));
        assert!(!area.is_inside(1.5, 1.5));
    }

    #[test]
    fn test_multiple_polygons_use_index() {
        let area = WalkableArea::from_polygons(vec![
            vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)],
            vec![(10.0, 10.0), (11.0, 10.0), (11.0, 11.0), (10.0, 11.0)],
        ])
        .unwrap();
        assert_eq!(area.polygon_count(), 2);
        assert!(area.is_inside(0.5, 0.5));
        assert!(area.is_inside(10.5, 10.5));
        assert!(!area.is_inside(5.0, 5.0));
    }

    #[test]
    fn test_bbox_fallback() {
        let area = WalkableArea::from_bounds(Rect::new(
            Coord { x: -1.0, y: -1.0 },
            Coord { x: 1.0, y: 1.0 },
        ));
        assert!(area.is_inside(0.0, 0.0));
        assert!(area.is_inside(1.0, 1.0));
        assert!(!area.is_inside(1.1, 0.0));
    }

    #[test]
    fn test_permissive_default() {
        let area = WalkableArea::permissive();
        assert!(area.is_inside(1e9, -1e9));
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let result = WalkableArea::from_polygons(vec![vec![(0.0, 0.0), (1.0, 0.0)]]);
        assert!(matches!(result, Err(MapError::DegeneratePolygon(0))));
    }

    #[test]
    fn test_non_finite_vertex_rejected() {
        let result =
            WalkableArea::from_polygons(vec![vec![(0.0, 0.0), (f64::NAN, 0.0), (1.0, 1.0)]]);
        assert!(matches!(result, Err(MapError::NonFiniteVertex(0))));
    }

    #[test]
    fn test_load_walkable_json() {
        let path = std::env::temp_dir().join("indoor_tracker_walkable_test.json");
        std::fs::write(
            &path,
            r#"{"polygons": [[[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]]]}"#,
        )
        .unwrap();
        let area = WalkableArea::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(area.polygon_count(), 1);
        assert!(area.is_inside(2.0, 2.0));
        assert!(!area.is_inside(5.0, 2.0));
    }
}
