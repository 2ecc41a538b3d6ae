//! Turns raw upstream layers into buildings, services and physical
//! objects in one local metric projection.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use geo::Geometry;
use geojson::{Feature, FeatureCollection};
use serde_json::Value;
use sirtep_config::ParsingConfig;
use sirtep_provision_models::{
    Building, BuildingId, ObjectId, PhysicalObject, PlanarPoint, Service, ServiceId,
    ServiceTypeId,
};
use sirtep_spatial::projection::{self, LocalProjection};

use crate::{NormativeRecord, RawProject, UpstreamError};

/// Parsed project, ready for scheduling and the matrix builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedProject {
    /// Living buildings with population estimates.
    pub buildings: Vec<Building>,
    /// Services with normalized capacity and radius.
    pub services: Vec<Service>,
    /// Physical objects with priorities.
    pub objects: Vec<PhysicalObject>,
}

impl ParsedProject {
    /// Distinct service types present, ascending.
    #[must_use]
    pub fn service_types(&self) -> Vec<ServiceTypeId> {
        let mut types: Vec<ServiceTypeId> = self.services.iter().map(|s| s.service_type).collect();
        types.sort_unstable();
        types.dedup();
        types
    }
}

/// Parses raw layers with explicit constants.
#[derive(Debug, Clone, Copy)]
pub struct ProjectParser {
    config: ParsingConfig,
}

fn int(value: Option<&Value>) -> Option<i64> {
    value.and_then(Value::as_i64)
}

fn num(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn feature_geometry(feature: &Feature, local: &LocalProjection) -> Option<Geometry<f64>> {
    feature
        .geometry
        .as_ref()
        .and_then(projection::from_geojson)
        .map(|g| local.project(&g))
}

/// First entry of the `physical_objects` array of a building feature.
fn first_physical_object(feature: &Feature) -> Option<&Value> {
    feature
        .property("physical_objects")
        .and_then(Value::as_array)
        .and_then(|objects| objects.first())
}

impl ProjectParser {
    /// Parser using `config`.
    #[must_use]
    pub const fn new(config: ParsingConfig) -> Self {
        Self { config }
    }

    /// Parses every layer of `raw`. `priorities` is the profile's ordered
    /// list of physical object types.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::NoLivingBuildings`] if the building layer
    /// is empty or has no usable geometry.
    pub fn parse(&self, raw: &RawProject, priorities: &[i64]) -> Result<ParsedProject, UpstreamError> {
        if raw.buildings.features.is_empty() {
            return Err(UpstreamError::NoLivingBuildings {
                scenario_id: raw.scenario_id,
            });
        }

        let wgs84: Vec<Geometry<f64>> = [&raw.buildings, &raw.services, &raw.objects]
            .into_iter()
            .flat_map(|layer| layer.features.iter())
            .filter_map(|f| f.geometry.as_ref().and_then(projection::from_geojson))
            .collect();
        let Some(local) = LocalProjection::for_geometries(&wgs84) else {
            return Err(UpstreamError::NoLivingBuildings {
                scenario_id: raw.scenario_id,
            });
        };

        Ok(ParsedProject {
            buildings: self.parse_buildings(&raw.buildings, &local),
            services: self.parse_services(&raw.services, &raw.normatives, &local),
            objects: self.parse_objects(&raw.objects, priorities, &local),
        })
    }

    /// Population = footprint area × floors × living-area coefficient /
    /// metres per human. Missing floors take the mean of the known ones,
    /// or the configured default when none is known.
    #[must_use]
    pub fn parse_buildings(
        &self,
        layer: &FeatureCollection,
        local: &LocalProjection,
    ) -> Vec<Building> {
        struct Draft {
            id: BuildingId,
            location: Option<PlanarPoint>,
            area: f64,
            floors: Option<f64>,
        }

        let mut drafts = Vec::with_capacity(layer.features.len());
        for feature in &layer.features {
            let object = first_physical_object(feature);
            let Some(id) = int(object.and_then(|o| o.get("physical_object_id")))
                .or_else(|| int(feature.property("physical_object_id")))
            else {
                log::warn!("Skipping living building without physical_object_id");
                continue;
            };
            let floors = num(object
                .and_then(|o| o.get("building"))
                .and_then(|b| b.get("floors")))
            .filter(|f| *f > 0.0);
            let geometry = feature_geometry(feature, local);

            drafts.push(Draft {
                id: BuildingId(id),
                location: geometry.as_ref().and_then(projection::centroid),
                area: geometry.as_ref().map_or(0.0, projection::area),
                floors,
            });
        }

        let known: Vec<f64> = drafts.iter().filter_map(|d| d.floors).collect();
        #[allow(clippy::cast_precision_loss)]
        let fallback_floors = if known.is_empty() {
            self.config.default_floors
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };

        let buildings: Vec<Building> = drafts
            .into_iter()
            .map(|d| {
                let floors = d.floors.unwrap_or(fallback_floors);
                Building {
                    id: d.id,
                    location: d.location,
                    population: d.area * floors * self.config.living_area_coef
                        / self.config.metres_per_human,
                    footprint_area: d.area,
                    floors,
                    built_period: None,
                }
            })
            .collect();

        log::info!(
            "Parsed {} living buildings ({} with known floors, fallback {fallback_floors:.2})",
            buildings.len(),
            known.len()
        );
        buildings
    }

    /// Capacity is normalized by the per-1000 normative of the service
    /// type; radius = minutes × speed. Services without a weight, a
    /// capacity or a usable normative are dropped.
    #[must_use]
    pub fn parse_services(
        &self,
        layer: &FeatureCollection,
        normatives: &[NormativeRecord],
        local: &LocalProjection,
    ) -> Vec<Service> {
        let normatives: BTreeMap<ServiceTypeId, &NormativeRecord> =
            normatives.iter().map(|n| (n.service_type, n)).collect();
        let mut services = Vec::with_capacity(layer.features.len());
        let mut unweighted = 0_usize;

        for feature in &layer.features {
            let Some(id) = int(feature.property("service_id")) else {
                log::warn!("Skipping service without service_id");
                continue;
            };
            let service_type = feature.property("service_type");
            let Some(type_id) = int(service_type.and_then(|t| t.get("service_type_id")))
                .or_else(|| int(feature.property("service_type_id")))
            else {
                log::warn!("Skipping service {id} without a service type");
                continue;
            };
            let Some(weight) = num(service_type
                .and_then(|t| t.get("properties"))
                .and_then(|p| p.get("weight_value")))
            else {
                unweighted += 1;
                continue;
            };
            let Some(raw_capacity) = num(service_type.and_then(|t| t.get("capacity_modeled")))
                .or_else(|| num(feature.property("capacity")))
            else {
                log::warn!("Skipping service {id} without capacity");
                continue;
            };

            let normative = normatives.get(&ServiceTypeId(type_id));
            let Some((per_1000, minutes)) = normative.and_then(|n| {
                n.capacity_per_1000
                    .filter(|c| *c > 0.0)
                    .zip(n.time_availability_minutes.filter(|m| *m >= 0.0))
            }) else {
                log::warn!("Skipping service {id}: no usable normative for type {type_id}");
                continue;
            };

            let geometry = feature_geometry(feature, local);
            services.push(Service {
                id: ServiceId(id),
                service_type: ServiceTypeId(type_id),
                location: geometry.as_ref().and_then(projection::representative_point),
                capacity: raw_capacity * 1000.0 / per_1000,
                radius_m: minutes * self.config.travel_speed_kmh * 1000.0 / 60.0,
                footprint_area: geometry.as_ref().map_or(0.0, projection::area),
                weight,
                built_period: None,
            });
        }

        log::info!(
            "Parsed {} services ({unweighted} without weight dropped)",
            services.len()
        );
        services
    }

    /// Priority is the index of the object's type in `priorities`.
    /// Non-polygonal objects get the area of a circle with the configured
    /// buffer radius.
    #[must_use]
    pub fn parse_objects(
        &self,
        layer: &FeatureCollection,
        priorities: &[i64],
        local: &LocalProjection,
    ) -> Vec<PhysicalObject> {
        let buffer_area = PI * self.config.non_poly_objects_buffer_m.powi(2);
        let mut objects = Vec::with_capacity(layer.features.len());

        for feature in &layer.features {
            let Some(id) = int(feature.property("physical_object_id")) else {
                log::warn!("Skipping physical object without physical_object_id");
                continue;
            };
            let Some(object_type) = int(feature
                .property("physical_object_type")
                .and_then(|t| t.get("physical_object_type_id")))
            .or_else(|| int(feature.property("physical_object_type_id")))
            else {
                log::warn!("Skipping physical object {id} without a type");
                continue;
            };
            let Some(priority) = priorities.iter().position(|t| *t == object_type) else {
                log::warn!("Skipping physical object {id}: type {object_type} is not in the profile");
                continue;
            };

            let area = match feature_geometry(feature, local) {
                Some(g) if projection::is_areal(&g) => projection::area(&g),
                _ => buffer_area,
            };

            objects.push(PhysicalObject {
                id: ObjectId(id),
                object_type,
                priority,
                area,
            });
        }

        log::info!("Parsed {} physical objects", objects.len());
        objects
    }
}
