//! Selection tools: radius lens, drawn polygon and click pick.
//!
//! Geometry stays opaque everywhere else; it is only decoded here, once,
//! when the index is built.

use crate::types::Feature;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo::{Centroid, HaversineDistance, Intersects, MultiPolygon, Point, Polygon};
use geojson::GeoJson;
use rstar::{RTree, RTreeObject, AABB};
use serde_json::Value;
use tracing::debug;

const KM_PER_DEGREE_LAT: f64 = 111.32;

// Wrapper for RTree indexing
struct BlockEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for BlockEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Decodes a GeoJSON geometry into polygons. Non-areal or malformed
/// geometries yield `None`.
pub fn to_multipolygon(value: &Value) -> Option<MultiPolygon<f64>> {
    let geometry = match GeoJson::from_json_value(value.clone()).ok()? {
        GeoJson::Geometry(g) => g,
        GeoJson::Feature(f) => f.geometry?,
        GeoJson::FeatureCollection(_) => return None,
    };
    let geometry: geo::Geometry<f64> = geometry.value.try_into().ok()?;
    match geometry {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        _ => None,
    }
}

fn envelope_of(geometry: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    let rect = geometry.bounding_rect()?;
    Some(AABB::from_corners(
        [rect.min().x, rect.min().y],
        [rect.max().x, rect.max().y],
    ))
}

/// R-tree over the blocks of one collection. Query results are indices into
/// that collection, in collection order.
pub struct SpatialIndex {
    blocks: Vec<Option<MultiPolygon<f64>>>,
    tree: RTree<BlockEnvelope>,
}

impl SpatialIndex {
    pub fn build(features: &[Feature]) -> Self {
        let blocks: Vec<Option<MultiPolygon<f64>>> = features
            .iter()
            .map(|f| to_multipolygon(&f.geometry))
            .collect();
        let items: Vec<BlockEnvelope> = blocks
            .iter()
            .enumerate()
            .filter_map(|(index, block)| {
                let aabb = envelope_of(block.as_ref()?)?;
                Some(BlockEnvelope { index, aabb })
            })
            .collect();
        debug!("Indexed {} of {} blocks", items.len(), features.len());
        Self {
            blocks,
            tree: RTree::bulk_load(items),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks whose centroid lies within `radius_km` of `center`.
    pub fn within_radius(&self, center: Point<f64>, radius_km: f64) -> Vec<usize> {
        if radius_km <= 0.0 {
            return Vec::new();
        }
        // Padded so the degree box always covers the circle.
        let dlat = radius_km / KM_PER_DEGREE_LAT * 1.1;
        let dlng = dlat / center.y().to_radians().cos().abs().max(1e-6);
        let envelope = AABB::from_corners(
            [center.x() - dlng, center.y() - dlat],
            [center.x() + dlng, center.y() + dlat],
        );
        let radius_m = radius_km * 1000.0;
        self.collect(envelope, |block| {
            block
                .centroid()
                .map_or(false, |c| c.haversine_distance(&center) <= radius_m)
        })
    }

    /// Blocks touching the drawn polygon.
    pub fn within_polygon(&self, drawn: &MultiPolygon<f64>) -> Vec<usize> {
        let Some(envelope) = envelope_of(drawn) else {
            return Vec::new();
        };
        self.collect(envelope, |block| {
            drawn.0.iter().any(|polygon: &Polygon<f64>| block.intersects(polygon))
        })
    }

    /// The block containing `point`, if any.
    pub fn pick(&self, point: Point<f64>) -> Option<usize> {
        let envelope = AABB::from_point([point.x(), point.y()]);
        self.collect(envelope, |block| block.contains(&point))
            .into_iter()
            .next()
    }

    fn collect<F>(&self, envelope: AABB<[f64; 2]>, keep: F) -> Vec<usize>
    where
        F: Fn(&MultiPolygon<f64>) -> bool,
    {
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|candidate| {
                self.blocks
                    .get(candidate.index)
                    .and_then(Option::as_ref)
                    .map_or(false, &keep)
            })
            .map(|candidate| candidate.index)
            .collect();
        hits.sort_unstable();
        hits
    }
}

/// Clones the selected blocks, preserving index order.
pub fn select(features: &[Feature], indices: &[usize]) -> Vec<Feature> {
    indices
        .iter()
        .filter_map(|&i| features.get(i).cloned())
        .collect()
}
