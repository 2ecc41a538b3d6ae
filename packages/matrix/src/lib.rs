#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Accessibility matrix construction.
//!
//! Builds a sparse building x service distance matrix from two R-tree
//! indexes (bounded by the largest normative radius in the input), then
//! binarizes it per service type: a pair is accessible iff its planar
//! distance is within the radius of the service's type.
//!
//! Co-located points (distance 0) are kept and count as accessible.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sirtep_provision_models::{Building, BuildingId, Service, ServiceId, ServiceTypeId};
use sirtep_spatial::SpatialIndex;

/// Errors from matrix construction.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    /// A service carries a radius that cannot bound a query.
    #[error("Invalid normative radius {radius} for service {service_id} (type {service_type})")]
    InvalidRadius {
        /// Offending service.
        service_id: ServiceId,
        /// Its type.
        service_type: ServiceTypeId,
        /// The radius value.
        radius: f64,
    },
}

/// Entities left out of the spatial indexes because their geometry has no
/// usable representative point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntities {
    /// Buildings without a valid centroid, in input order.
    pub buildings: Vec<BuildingId>,
    /// Services without a valid point, in input order.
    pub services: Vec<ServiceId>,
}

impl SkippedEntities {
    /// Nothing was skipped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buildings.is_empty() && self.services.is_empty()
    }
}

/// Sparse planar distances between buildings (rows) and services
/// (columns). Missing entries are farther apart than the query radius or
/// involve a skipped entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistanceMatrix {
    building_ids: BTreeSet<BuildingId>,
    service_ids: BTreeSet<ServiceId>,
    rows: BTreeMap<BuildingId, BTreeMap<ServiceId, f64>>,
}

impl DistanceMatrix {
    /// Distance for one pair, if measured.
    #[must_use]
    pub fn get(&self, building: BuildingId, service: ServiceId) -> Option<f64> {
        self.rows.get(&building)?.get(&service).copied()
    }

    /// Row index space (every input building id).
    #[must_use]
    pub const fn building_ids(&self) -> &BTreeSet<BuildingId> {
        &self.building_ids
    }

    /// Column index space (every input service id).
    #[must_use]
    pub const fn service_ids(&self) -> &BTreeSet<ServiceId> {
        &self.service_ids
    }

    /// Number of measured pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    /// No pair was measured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Measured pairs in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (BuildingId, ServiceId, f64)> + '_ {
        self.rows
            .iter()
            .flat_map(|(b, row)| row.iter().map(move |(s, d)| (*b, *s, *d)))
    }
}

/// Binary building x service accessibility relation.
///
/// Only accessible pairs are stored; everything else in the index space is
/// inaccessible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityMatrix {
    building_ids: BTreeSet<BuildingId>,
    service_ids: BTreeSet<ServiceId>,
    rows: BTreeMap<BuildingId, BTreeSet<ServiceId>>,
}

impl AccessibilityMatrix {
    /// Whether `service` is reachable from `building`.
    #[must_use]
    pub fn is_accessible(&self, building: BuildingId, service: ServiceId) -> bool {
        self.rows
            .get(&building)
            .is_some_and(|row| row.contains(&service))
    }

    /// Services reachable from `building` (empty for unknown ids).
    pub fn reachable_services(&self, building: BuildingId) -> impl Iterator<Item = ServiceId> + '_ {
        self.rows.get(&building).into_iter().flatten().copied()
    }

    /// Accessible pairs in row-major order.
    pub fn pairs(&self) -> impl Iterator<Item = (BuildingId, ServiceId)> + '_ {
        self.rows
            .iter()
            .flat_map(|(b, row)| row.iter().map(move |s| (*b, *s)))
    }

    /// Row index space.
    #[must_use]
    pub const fn building_ids(&self) -> &BTreeSet<BuildingId> {
        &self.building_ids
    }

    /// Column index space.
    #[must_use]
    pub const fn service_ids(&self) -> &BTreeSet<ServiceId> {
        &self.service_ids
    }

    /// Number of accessible pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.values().map(BTreeSet::len).sum()
    }

    /// No pair is accessible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of [`MatrixBuilder::build`].
#[derive(Debug, Clone)]
pub struct MatrixBuild {
    /// The binarized matrix.
    pub matrix: AccessibilityMatrix,
    /// Entities that could not be indexed.
    pub skipped: SkippedEntities,
    /// The global query radius that bounded the search.
    pub max_radius: f64,
}

/// Builds accessibility matrices from parsed buildings and services.
pub struct MatrixBuilder;

impl MatrixBuilder {
    /// Computes the distance matrix and binarizes it.
    ///
    /// The query radius is the largest normative radius among `services`.
    ///
    /// # Errors
    ///
    /// Returns [`MatrixError::InvalidRadius`] if a service radius is
    /// negative or not finite.
    pub fn build(buildings: &[Building], services: &[Service]) -> Result<MatrixBuild, MatrixError> {
        let start = Instant::now();
        let radii = Self::type_radii(services)?;
        let max_radius = radii.values().copied().fold(0.0_f64, f64::max);

        let (distances, skipped) = Self::distance_matrix(buildings, services, max_radius);
        let matrix = Self::binarize_with(&distances, services, &radii);

        if !skipped.is_empty() {
            log::warn!(
                "Skipped {} buildings and {} services with degenerate geometry",
                skipped.buildings.len(),
                skipped.services.len()
            );
        }
        log::info!(
            "Accessibility matrix {}x{}: {} of {} measured pairs accessible (max radius {max_radius:.0} m) in {:?}",
            buildings.len(),
            services.len(),
            matrix.len(),
            distances.len(),
            start.elapsed()
        );

        Ok(MatrixBuild {
            matrix,
            skipped,
            max_radius,
        })
    }

    /// Sparse distances for every building/service pair within
    /// `max_radius` meters.
    #[must_use]
    pub fn distance_matrix(
        buildings: &[Building],
        services: &[Service],
        max_radius: f64,
    ) -> (DistanceMatrix, SkippedEntities) {
        let (building_index, skipped_buildings) =
            SpatialIndex::build(buildings.iter().map(|b| (b.id, b.location)));
        let (service_index, skipped_services) =
            SpatialIndex::build(services.iter().map(|s| (s.id, s.location)));

        let mut rows: BTreeMap<BuildingId, BTreeMap<ServiceId, f64>> = BTreeMap::new();
        for (building, service, distance) in building_index.pairs_within(&service_index, max_radius)
        {
            rows.entry(building).or_default().insert(service, distance);
        }

        (
            DistanceMatrix {
                building_ids: buildings.iter().map(|b| b.id).collect(),
                service_ids: services.iter().map(|s| s.id).collect(),
                rows,
            },
            SkippedEntities {
                buildings: skipped_buildings,
                services: skipped_services,
            },
        )
    }

    /// Binarizes `distances` with the normative radius of each service's
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`MatrixError::InvalidRadius`] if a service radius is
    /// negative or not finite.
    pub fn binarize(
        distances: &DistanceMatrix,
        services: &[Service],
    ) -> Result<AccessibilityMatrix, MatrixError> {
        let radii = Self::type_radii(services)?;
        Ok(Self::binarize_with(distances, services, &radii))
    }

    fn binarize_with(
        distances: &DistanceMatrix,
        services: &[Service],
        radii: &BTreeMap<ServiceTypeId, f64>,
    ) -> AccessibilityMatrix {
        let column_radius: BTreeMap<ServiceId, f64> = services
            .iter()
            .filter_map(|s| radii.get(&s.service_type).map(|r| (s.id, *r)))
            .collect();

        let mut rows: BTreeMap<BuildingId, BTreeSet<ServiceId>> = BTreeMap::new();
        for (building, service, distance) in distances.iter() {
            if column_radius
                .get(&service)
                .is_some_and(|radius| distance <= *radius)
            {
                rows.entry(building).or_default().insert(service);
            }
        }

        AccessibilityMatrix {
            building_ids: distances.building_ids.clone(),
            service_ids: distances.service_ids.clone(),
            rows,
        }
    }

    /// One radius per service type: the radius of the first service of
    /// that type in input order.
    fn type_radii(services: &[Service]) -> Result<BTreeMap<ServiceTypeId, f64>, MatrixError> {
        let mut radii: BTreeMap<ServiceTypeId, f64> = BTreeMap::new();
        for service in services {
            if !service.radius_m.is_finite() || service.radius_m < 0.0 {
                return Err(MatrixError::InvalidRadius {
                    service_id: service.id,
                    service_type: service.service_type,
                    radius: service.radius_m,
                });
            }
            let radius = *radii.entry(service.service_type).or_insert(service.radius_m);
            if (radius - service.radius_m).abs() > f64::EPSILON {
                log::warn!(
                    "Service {} declares radius {} m but type {} uses {radius} m",
                    service.id,
                    service.radius_m,
                    service.service_type
                );
            }
        }
        Ok(radii)
    }
}

#[cfg(test)]
mod tests {
    use sirtep_provision_models::PlanarPoint;

    use super::*;

    fn building(id: i64, location: Option<(f64, f64)>) -> Building {
        Building {
            id: BuildingId(id),
            location: location.map(|(x, y)| PlanarPoint::new(x, y)),
            population: 100.0,
            footprint_area: 200.0,
            floors: 5.0,
            built_period: None,
        }
    }

    fn service(id: i64, service_type: i64, location: Option<(f64, f64)>, radius: f64) -> Service {
        Service {
            id: ServiceId(id),
            service_type: ServiceTypeId(service_type),
            location: location.map(|(x, y)| PlanarPoint::new(x, y)),
            capacity: 10.0,
            radius_m: radius,
            footprint_area: 50.0,
            weight: 1.0,
            built_period: None,
        }
    }

    #[test]
    fn binarizes_each_column_with_its_type_radius() {
        let buildings = vec![building(1, Some((0.0, 0.0)))];
        let services = vec![
            // type 10: 300 m radius
            service(100, 10, Some((250.0, 0.0)), 300.0),
            service(101, 10, Some((350.0, 0.0)), 300.0),
            // type 20: 1000 m radius
            service(200, 20, Some((350.0, 0.0)), 1000.0),
            service(201, 20, Some((1500.0, 0.0)), 1000.0),
        ];

        let build = MatrixBuilder::build(&buildings, &services).unwrap();
        let m = &build.matrix;

        assert!((build.max_radius - 1000.0).abs() < f64::EPSILON);
        assert!(m.is_accessible(BuildingId(1), ServiceId(100)));
        assert!(!m.is_accessible(BuildingId(1), ServiceId(101)));
        assert!(m.is_accessible(BuildingId(1), ServiceId(200)));
        assert!(!m.is_accessible(BuildingId(1), ServiceId(201)));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn entry_is_one_iff_distance_within_radius() {
        let buildings: Vec<Building> = (0..20_i32)
            .map(|i| building(i64::from(i), Some((f64::from(i) * 37.0, 11.0))))
            .collect();
        let services = vec![
            service(1, 1, Some((0.0, 0.0)), 150.0),
            service(2, 2, Some((400.0, 0.0)), 90.0),
            service(3, 1, Some((700.0, 5.0)), 150.0),
        ];

        let build = MatrixBuilder::build(&buildings, &services).unwrap();
        for b in &buildings {
            for s in &services {
                let d = b.location.unwrap().distance_to(&s.location.unwrap());
                let radius = if s.service_type == ServiceTypeId(1) { 150.0 } else { 90.0 };
                assert_eq!(
                    build.matrix.is_accessible(b.id, s.id),
                    d <= radius,
                    "building {} service {} distance {d}",
                    b.id,
                    s.id
                );
            }
        }
    }

    #[test]
    fn co_located_points_are_accessible() {
        let buildings = vec![building(1, Some((10.0, 10.0)))];
        let services = vec![service(5, 1, Some((10.0, 10.0)), 100.0)];

        let build = MatrixBuilder::build(&buildings, &services).unwrap();
        assert!(build.matrix.is_accessible(BuildingId(1), ServiceId(5)));
    }

    #[test]
    fn degenerate_geometry_is_skipped_and_reported() {
        let buildings = vec![
            building(1, Some((0.0, 0.0))),
            building(2, None),
            building(3, Some((f64::NAN, 0.0))),
        ];
        let services = vec![
            service(10, 1, Some((5.0, 0.0)), 100.0),
            service(11, 1, None, 100.0),
        ];

        let first = MatrixBuilder::build(&buildings, &services).unwrap();
        let second = MatrixBuilder::build(&buildings, &services).unwrap();

        assert_eq!(first.skipped.buildings, vec![BuildingId(2), BuildingId(3)]);
        assert_eq!(first.skipped.services, vec![ServiceId(11)]);
        assert_eq!(first.matrix, second.matrix);
        assert_eq!(
            first.matrix.pairs().collect::<Vec<_>>(),
            vec![(BuildingId(1), ServiceId(10))]
        );
        // index space still covers every input id
        assert_eq!(first.matrix.building_ids().len(), 3);
        assert_eq!(first.matrix.service_ids().len(), 2);
    }

    #[test]
    fn empty_inputs_give_empty_matrix() {
        let build = MatrixBuilder::build(&[], &[]).unwrap();
        assert!(build.matrix.is_empty());
        assert!(build.max_radius.abs() < f64::EPSILON);

        let buildings = vec![building(1, Some((0.0, 0.0)))];
        let build = MatrixBuilder::build(&buildings, &[]).unwrap();
        assert!(build.matrix.is_empty());
        assert_eq!(build.matrix.reachable_services(BuildingId(1)).count(), 0);
    }

    #[test]
    fn rejects_invalid_radius() {
        let services = vec![service(1, 1, Some((0.0, 0.0)), -5.0)];
        let err = MatrixBuilder::build(&[], &services).unwrap_err();
        assert!(matches!(err, MatrixError::InvalidRadius { .. }));
    }

    #[test]
    fn distance_matrix_is_bounded_by_max_radius() {
        let buildings = vec![building(1, Some((0.0, 0.0)))];
        let services = vec![
            service(1, 1, Some((100.0, 0.0)), 100.0),
            service(2, 1, Some((101.0, 0.0)), 100.0),
        ];
        let (distances, skipped) = MatrixBuilder::distance_matrix(&buildings, &services, 100.0);
        assert!(skipped.is_empty());
        assert_eq!(distances.len(), 1);
        assert!((distances.get(BuildingId(1), ServiceId(1)).unwrap() - 100.0).abs() < 1e-9);
        assert!(distances.get(BuildingId(1), ServiceId(2)).is_none());

        let matrix = MatrixBuilder::binarize(&distances, &services).unwrap();
        assert_eq!(matrix.len(), 1);
    }
}
