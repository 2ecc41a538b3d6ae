#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! In-memory spatial index over building and service points.
//!
//! Points are expected in a local planar coordinate system (meters), see
//! [`projection::LocalProjection`]. The index is an R-tree that answers
//! bounded-radius and nearest-neighbor queries, so the matrix builder
//! never has to compare every building with every service.

pub mod projection;

use rstar::{AABB, PointDistance, RTree, RTreeObject};
use sirtep_provision_models::PlanarPoint;

/// A keyed point stored in the R-tree.
struct PointEntry<K> {
    key: K,
    point: [f64; 2],
}

impl<K> RTreeObject for PointEntry<K> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl<K> PointDistance for PointEntry<K> {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx.mul_add(dx, dy * dy)
    }
}

/// R-tree over keyed planar points.
pub struct SpatialIndex<K> {
    tree: RTree<PointEntry<K>>,
}

impl<K: Copy> SpatialIndex<K> {
    /// Bulk-loads the index.
    ///
    /// Entries without a location, or with a non-finite one, are not
    /// indexed; their keys are returned in input order as the second
    /// element so callers can report them.
    pub fn build<I>(items: I) -> (Self, Vec<K>)
    where
        I: IntoIterator<Item = (K, Option<PlanarPoint>)>,
    {
        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for (key, location) in items {
            match location {
                Some(p) if p.is_finite() => entries.push(PointEntry {
                    key,
                    point: [p.x, p.y],
                }),
                _ => skipped.push(key),
            }
        }

        (
            Self {
                tree: RTree::bulk_load(entries),
            },
            skipped,
        )
    }

    /// Number of indexed points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Whether nothing was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// All indexed keys with their points, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (K, PlanarPoint)> + '_ {
        self.tree
            .iter()
            .map(|e| (e.key, PlanarPoint::new(e.point[0], e.point[1])))
    }

    /// Keys within `radius` meters of `point` (inclusive), with distances.
    pub fn within_radius(
        &self,
        point: PlanarPoint,
        radius: f64,
    ) -> impl Iterator<Item = (K, f64)> + '_ {
        let query = [point.x, point.y];
        self.tree
            .locate_within_distance(query, radius * radius)
            .map(move |e| (e.key, e.distance_2(&query).sqrt()))
    }

    /// The closest indexed key to `point`, with its distance.
    #[must_use]
    pub fn nearest(&self, point: PlanarPoint) -> Option<(K, f64)> {
        let query = [point.x, point.y];
        self.tree
            .nearest_neighbor(&query)
            .map(|e| (e.key, e.distance_2(&query).sqrt()))
    }

    /// Every `(self key, other key, distance)` pair closer than
    /// `max_radius` (inclusive).
    ///
    /// Walks the smaller of the two trees and queries the larger one.
    #[must_use]
    pub fn pairs_within<L: Copy>(
        &self,
        other: &SpatialIndex<L>,
        max_radius: f64,
    ) -> Vec<(K, L, f64)> {
        let mut pairs = Vec::new();
        if self.len() <= other.len() {
            for (key, point) in self.iter() {
                for (other_key, distance) in other.within_radius(point, max_radius) {
                    pairs.push((key, other_key, distance));
                }
            }
        } else {
            for (other_key, point) in other.iter() {
                for (key, distance) in self.within_radius(point, max_radius) {
                    pairs.push((key, other_key, distance));
                }
            }
        }
        log::debug!(
            "Radius query ({max_radius:.1} m) over {}x{} points produced {} pairs",
            self.len(),
            other.len(),
            pairs.len()
        );
        pairs
    }
}
