#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Access to project data in the urban data API.
//!
//! [`ProjectDataSource`] is the seam the orchestrator depends on;
//! [`client::UrbanApiClient`] implements it over HTTP. Raw layers come
//! back as `GeoJSON` feature collections and are turned into buildings,
//! services and physical objects by [`parser::ProjectParser`].

pub mod client;
pub mod parser;
pub mod retry;

#[cfg(test)]
mod test_server;

use async_trait::async_trait;
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use sirtep_provision_models::ServiceTypeId;

pub use client::UrbanApiClient;
pub use parser::{ParsedProject, ProjectParser};

/// Upstream physical object type id of living buildings.
pub const LIVING_BUILDING_TYPE_ID: i64 = 4;

/// Errors from fetching or parsing upstream data.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// HTTP transport failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A response did not have the expected shape.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success status after retries (or a permanent 4xx).
    #[error("HTTP {status} from {url} after {retries} retries")]
    Status {
        /// Requested URL.
        url: String,
        /// Final status code.
        status: u16,
        /// Retries spent.
        retries: u32,
    },

    /// Malformed or unusable response.
    #[error("Unexpected upstream response: {message}")]
    Response {
        /// Description of what went wrong.
        message: String,
    },

    /// The scenario has no living buildings.
    #[error("No living buildings found in scenario {scenario_id}")]
    NoLivingBuildings {
        /// Scenario id.
        scenario_id: i64,
    },
}

/// Scenario metadata needed before fetching layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    /// Scenario id.
    pub scenario_id: i64,
    /// Last modification timestamp, used as the cache version.
    pub version: String,
    /// Region id, used to fetch normatives.
    pub territory_id: i64,
}

/// Regional service normative for one service type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawNormative")]
pub struct NormativeRecord {
    /// Service type.
    pub service_type: ServiceTypeId,
    /// Required capacity per 1000 residents.
    pub capacity_per_1000: Option<f64>,
    /// Normative travel time, minutes.
    pub time_availability_minutes: Option<f64>,
}

#[derive(Deserialize)]
struct RawNormativeServiceType {
    id: i64,
}

#[derive(Deserialize)]
struct RawNormative {
    service_type: RawNormativeServiceType,
    services_capacity_per_1000_normative: Option<f64>,
    time_availability_minutes: Option<f64>,
}

impl From<RawNormative> for NormativeRecord {
    fn from(raw: RawNormative) -> Self {
        Self {
            service_type: ServiceTypeId(raw.service_type.id),
            capacity_per_1000: raw.services_capacity_per_1000_normative,
            time_availability_minutes: raw.time_availability_minutes,
        }
    }
}

/// Unparsed project layers, all in WGS84.
#[derive(Debug, Clone)]
pub struct RawProject {
    /// Scenario the layers belong to.
    pub scenario_id: i64,
    /// Living buildings.
    pub buildings: FeatureCollection,
    /// Services.
    pub services: FeatureCollection,
    /// Regional normatives.
    pub normatives: Vec<NormativeRecord>,
    /// Physical objects of the profile's priority types.
    pub objects: FeatureCollection,
}

/// Source of project data. Implemented over HTTP by
/// [`UrbanApiClient`]; tests use in-memory fakes.
#[async_trait]
pub trait ProjectDataSource: Send + Sync {
    /// Scenario metadata.
    async fn scenario_info(
        &self,
        scenario_id: i64,
        token: Option<&str>,
    ) -> Result<ScenarioInfo, UpstreamError>;

    /// Living building layer.
    async fn living_buildings(
        &self,
        scenario_id: i64,
        token: Option<&str>,
    ) -> Result<FeatureCollection, UpstreamError>;

    /// Service layer.
    async fn services(
        &self,
        scenario_id: i64,
        token: Option<&str>,
    ) -> Result<FeatureCollection, UpstreamError>;

    /// Service normatives of a territory.
    async fn normatives(&self, territory_id: i64) -> Result<Vec<NormativeRecord>, UpstreamError>;

    /// Physical objects of the given types, merged into one collection.
    async fn physical_objects(
        &self,
        scenario_id: i64,
        object_types: &[i64],
        token: Option<&str>,
    ) -> Result<FeatureCollection, UpstreamError>;
}

/// Fetches every layer of a scenario concurrently.
///
/// # Errors
///
/// Returns the first [`UpstreamError`] any request produces.
pub async fn fetch_project(
    source: &dyn ProjectDataSource,
    scenario: &ScenarioInfo,
    object_types: &[i64],
    token: Option<&str>,
) -> Result<RawProject, UpstreamError> {
    let (buildings, services, normatives, objects) = tokio::try_join!(
        source.living_buildings(scenario.scenario_id, token),
        source.services(scenario.scenario_id, token),
        source.normatives(scenario.territory_id),
        source.physical_objects(scenario.scenario_id, object_types, token),
    )?;

    log::info!(
        "Scenario {}: {} buildings, {} services, {} normatives, {} objects",
        scenario.scenario_id,
        buildings.features.len(),
        services.features.len(),
        normatives.len(),
        objects.features.len()
    );

    Ok(RawProject {
        scenario_id: scenario.scenario_id,
        buildings,
        services,
        normatives,
        objects,
    })
}

/// An empty feature collection.
#[must_use]
pub const fn empty_collection() -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: Vec::new(),
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normative_from_upstream_shape() {
        let json = serde_json::json!([
            {
                "service_type": { "id": 21, "name": "school" },
                "services_capacity_per_1000_normative": 120.0,
                "time_availability_minutes": 15,
                "year": 2024
            },
            {
                "service_type": { "id": 22, "name": "clinic" },
                "services_capacity_per_1000_normative": null,
                "time_availability_minutes": null
            }
        ]);
        let records: Vec<NormativeRecord> = serde_json::from_value(json).unwrap();
        assert_eq!(records[0].service_type, ServiceTypeId(21));
        assert_eq!(records[0].capacity_per_1000, Some(120.0));
        assert_eq!(records[0].time_availability_minutes, Some(15.0));
        assert_eq!(records[1].capacity_per_1000, None);
    }
}
