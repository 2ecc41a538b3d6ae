//! HTTP implementation of [`ProjectDataSource`].

use async_trait::async_trait;
use geojson::FeatureCollection;
use serde::Deserialize;
use sirtep_config::UrbanApiConfig;

use crate::retry::{self, RetryPolicy};
use crate::{
    LIVING_BUILDING_TYPE_ID, NormativeRecord, ProjectDataSource, ScenarioInfo, UpstreamError,
    empty_collection,
};

#[derive(Deserialize)]
struct RawRegion {
    id: i64,
}

#[derive(Deserialize)]
struct RawScenarioProject {
    region: RawRegion,
}

#[derive(Deserialize)]
struct RawScenario {
    scenario_id: Option<i64>,
    updated_at: String,
    project: RawScenarioProject,
}

/// Client for the urban data API.
#[derive(Debug, Clone)]
pub struct UrbanApiClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl UrbanApiClient {
    /// Builds a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &UrbanApiConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self::with_client(
            client,
            &config.base_url,
            RetryPolicy {
                max_retries: config.max_retries,
                ..RetryPolicy::default()
            },
        ))
    }

    /// Wraps an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    /// Base URL, without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: Option<&str>,
    ) -> Result<serde_json::Value, UpstreamError> {
        let url = format!("{}{path}", self.base_url);
        log::debug!("GET {url} {query:?}");
        retry::send_json(
            || {
                let request = self.client.get(&url).query(query);
                match token {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            },
            &self.retry,
        )
        .await
    }

    async fn get_features(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: Option<&str>,
    ) -> Result<FeatureCollection, UpstreamError> {
        let value = self.get_json(path, query, token).await?;
        if value.get("features").is_none_or(serde_json::Value::is_null) {
            return Ok(empty_collection());
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ProjectDataSource for UrbanApiClient {
    async fn scenario_info(
        &self,
        scenario_id: i64,
        token: Option<&str>,
    ) -> Result<ScenarioInfo, UpstreamError> {
        let value = self
            .get_json(&format!("/api/v1/scenarios/{scenario_id}"), &[], token)
            .await?;
        let raw: RawScenario = serde_json::from_value(value)?;
        Ok(ScenarioInfo {
            scenario_id: raw.scenario_id.unwrap_or(scenario_id),
            version: raw.updated_at,
            territory_id: raw.project.region.id,
        })
    }

    async fn living_buildings(
        &self,
        scenario_id: i64,
        token: Option<&str>,
    ) -> Result<FeatureCollection, UpstreamError> {
        self.get_features(
            &format!("/api/v1/scenarios/{scenario_id}/geometries_with_all_objects"),
            &[("physical_object_type_id", LIVING_BUILDING_TYPE_ID.to_string())],
            token,
        )
        .await
    }

    async fn services(
        &self,
        scenario_id: i64,
        token: Option<&str>,
    ) -> Result<FeatureCollection, UpstreamError> {
        self.get_features(
            &format!("/api/v1/scenarios/{scenario_id}/services_with_geometry"),
            &[],
            token,
        )
        .await
    }

    async fn normatives(&self, territory_id: i64) -> Result<Vec<NormativeRecord>, UpstreamError> {
        let value = self
            .get_json(&format!("/api/v1/territory/{territory_id}/normatives"), &[], None)
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn physical_objects(
        &self,
        scenario_id: i64,
        object_types: &[i64],
        token: Option<&str>,
    ) -> Result<FeatureCollection, UpstreamError> {
        let path = format!("/api/v1/scenarios/{scenario_id}/physical_objects_with_geometry");
        let layers = futures::future::try_join_all(object_types.iter().map(|type_id| {
            let query = [("physical_object_type_id", type_id.to_string())];
            let path = &path;
            async move { self.get_features(path, &query, token).await }
        }))
        .await?;

        let mut merged = empty_collection();
        for layer in layers {
            merged.features.extend(layer.features);
        }
        Ok(merged)
    }
}
