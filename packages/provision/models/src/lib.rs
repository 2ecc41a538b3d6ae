#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Value types shared by the matrix builder, the provision engine, the
//! cache and the HTTP layer.
//!
//! Buildings and services are immutable once parsed: assigning a schedule
//! produces new values via [`Building::with_built_period`] and
//! [`Service::with_built_period`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Upstream physical object id of a living building.
    BuildingId
);
id_type!(
    /// Upstream service id.
    ServiceId
);
id_type!(
    /// Upstream service type id (school, clinic, ...).
    ServiceTypeId
);
id_type!(
    /// Upstream physical object id of a non-building schedulable object.
    ObjectId
);

/// A point in the local planar (metric) coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanarPoint {
    /// Easting in meters.
    pub x: f64,
    /// Northing in meters.
    pub y: f64,
}

impl PlanarPoint {
    /// Creates a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Both coordinates are finite numbers.
    #[must_use]
    pub const fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Euclidean distance to another point, in meters.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// A living building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    /// Building id.
    pub id: BuildingId,
    /// Representative point (centroid). `None` for degenerate geometry.
    pub location: Option<PlanarPoint>,
    /// Estimated number of residents.
    pub population: f64,
    /// Footprint area in square meters.
    pub footprint_area: f64,
    /// Floor count used for the population estimate.
    pub floors: f64,
    /// Period in which the building is finished. `None` = never built.
    pub built_period: Option<u32>,
}

impl Building {
    /// Returns a copy with the given built-period.
    #[must_use]
    pub fn with_built_period(&self, built_period: Option<u32>) -> Self {
        Self {
            built_period,
            ..self.clone()
        }
    }

    /// Whether the building exists at the end of `period`.
    #[must_use]
    pub fn is_built_by(&self, period: u32) -> bool {
        self.built_period.is_some_and(|p| p <= period)
    }
}

/// A service (school, kindergarten, clinic, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Service id.
    pub id: ServiceId,
    /// Service type id.
    pub service_type: ServiceTypeId,
    /// Representative point. `None` for degenerate geometry.
    pub location: Option<PlanarPoint>,
    /// Capacity normalized by the per-1000 normative of its type.
    pub capacity: f64,
    /// Normative accessibility radius in meters.
    pub radius_m: f64,
    /// Footprint area in square meters.
    pub footprint_area: f64,
    /// Declared weight of the service.
    pub weight: f64,
    /// Period in which the service opens. `None` = never built.
    pub built_period: Option<u32>,
}

impl Service {
    /// Returns a copy with the given built-period.
    #[must_use]
    pub fn with_built_period(&self, built_period: Option<u32>) -> Self {
        Self {
            built_period,
            ..self.clone()
        }
    }

    /// Whether the service exists at the end of `period`.
    #[must_use]
    pub fn is_built_by(&self, period: u32) -> bool {
        self.built_period.is_some_and(|p| p <= period)
    }
}

/// A non-building object (road, park, utility) the profile schedules
/// ahead of houses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalObject {
    /// Object id.
    pub id: ObjectId,
    /// Upstream physical object type id.
    pub object_type: i64,
    /// Index of the type in the profile's priority list (0 = first).
    pub priority: usize,
    /// Footprint area in square meters.
    pub area: f64,
}

/// Provision percentages per period and service type.
///
/// Index `p` of [`Self::periods`] holds the values for period `p`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionTable {
    /// One map per period, service type id -> provision percent.
    pub periods: Vec<BTreeMap<ServiceTypeId, u32>>,
}

impl ProvisionTable {
    /// Wraps already-computed period rows.
    #[must_use]
    pub const fn new(periods: Vec<BTreeMap<ServiceTypeId, u32>>) -> Self {
        Self { periods }
    }

    /// Number of periods in the table.
    #[must_use]
    pub fn period_count(&self) -> usize {
        self.periods.len()
    }

    /// Provision for one cell, if both the period and the type exist.
    #[must_use]
    pub fn get(&self, period: usize, service_type: ServiceTypeId) -> Option<u32> {
        self.periods
            .get(period)
            .and_then(|row| row.get(&service_type).copied())
    }
}

/// Parameters identifying one provision computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    /// Project scenario id.
    pub scenario_id: i64,
    /// Project profile id (selects the object priority list).
    pub profile_id: i64,
    /// Number of schedule periods.
    pub periods: u32,
    /// Maximum constructible area per period, in square meters.
    pub max_area_per_period: u64,
}

/// Kind of schedulable entity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    /// Physical object (road, park, ...) scheduled ahead of houses.
    Object,
    /// Service.
    Service,
    /// Living building.
    Building,
}
