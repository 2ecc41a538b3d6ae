//! HTTP handler functions for the provision API.

use actix_web::http::{StatusCode, header};
use actix_web::{HttpRequest, HttpResponse, web};
use sirtep_cache::CacheError;
use sirtep_orchestrator::{OrchestratorError, ProvisionOutcome};
use sirtep_server_models::{
    ApiCacheDeleted, ApiError, ApiHealth, ApiProvisionResult, ApiTaskStatus, ProvisionQueryParams,
};
use sirtep_tasks::TaskError;
use sirtep_urban_api::UpstreamError;

use crate::AppState;

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /api/provision`
///
/// Returns the cached result or starts a computation. The caller's bearer
/// token is forwarded to the urban API.
pub async fn provision(
    state: web::Data<AppState>,
    params: web::Query<ProvisionQueryParams>,
    req: HttpRequest,
) -> HttpResponse {
    let token = bearer_token(&req);
    match state
        .orchestrator
        .start_or_fetch(params.into_inner().into(), token)
        .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response("Failed to start provision computation", &e),
    }
}

/// `GET /api/provision/status`
pub async fn provision_status(
    state: web::Data<AppState>,
    params: web::Query<ProvisionQueryParams>,
) -> HttpResponse {
    match state.orchestrator.poll(&params.into_inner().into()) {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response("Failed to read provision status", &e),
    }
}

/// `DELETE /api/cache`
pub async fn delete_cache(
    state: web::Data<AppState>,
    params: web::Query<ProvisionQueryParams>,
) -> HttpResponse {
    match state.orchestrator.invalidate(&params.into_inner().into()) {
        Ok(removed) => HttpResponse::Ok().json(ApiCacheDeleted { removed }),
        Err(e) => error_response("Failed to delete cache entries", &e),
    }
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn outcome_response(outcome: ProvisionOutcome) -> HttpResponse {
    match outcome {
        ProvisionOutcome::Completed {
            schedule,
            provision,
        } => HttpResponse::Ok().json(ApiProvisionResult::new(schedule, provision)),
        ProvisionOutcome::InProgress { task } => {
            HttpResponse::Accepted().json(ApiTaskStatus::from(task))
        }
        ProvisionOutcome::Failed { task } => {
            HttpResponse::InternalServerError().json(ApiTaskStatus::from(task))
        }
    }
}

fn status_code(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::InvalidRequest(_)
        | OrchestratorError::UnknownProfile { .. }
        | OrchestratorError::Upstream(UpstreamError::NoLivingBuildings { .. }) => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::NotStarted { .. }
        | OrchestratorError::Cache(CacheError::NotFound { .. })
        | OrchestratorError::Task(TaskError::NotFound { .. }) => StatusCode::NOT_FOUND,
        OrchestratorError::Upstream(UpstreamError::Status { status, .. })
            if matches!(*status, 401 | 403 | 404) =>
        {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        OrchestratorError::Upstream(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(context: &str, e: &OrchestratorError) -> HttpResponse {
    let status = status_code(e);
    if status.is_server_error() {
        log::error!("{context}: {e}");
    } else {
        log::warn!("{context}: {e}");
    }
    HttpResponse::build(status).json(ApiError::new(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use actix_web::{App, test};
    use async_trait::async_trait;
    use geojson::FeatureCollection;
    use serde_json::{Value, json};
    use sirtep_config::SirtepConfig;
    use sirtep_orchestrator::Orchestrator;
    use sirtep_provision_models::ServiceTypeId;
    use sirtep_schedule::AreaBudgetOptimizer;
    use sirtep_urban_api::{NormativeRecord, ProjectDataSource, ScenarioInfo, empty_collection};

    use super::*;
    use crate::configure;

    fn square(lon: f64, lat: f64) -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[
                [lon, lat],
                [lon + 0.0005, lat],
                [lon + 0.0005, lat + 0.0005],
                [lon, lat + 0.0005],
                [lon, lat]
            ]]
        })
    }

    fn collection(features: &[Value]) -> FeatureCollection {
        serde_json::from_value(json!({ "type": "FeatureCollection", "features": features }))
            .unwrap()
    }

    #[derive(Default)]
    struct FakeSource {
        no_buildings: bool,
        tokens: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ProjectDataSource for FakeSource {
        async fn scenario_info(
            &self,
            scenario_id: i64,
            token: Option<&str>,
        ) -> Result<ScenarioInfo, UpstreamError> {
            self.tokens.lock().unwrap().push(token.map(str::to_string));
            Ok(ScenarioInfo {
                scenario_id,
                version: "v1".to_string(),
                territory_id: 1,
            })
        }

        async fn living_buildings(
            &self,
            _scenario_id: i64,
            _token: Option<&str>,
        ) -> Result<FeatureCollection, UpstreamError> {
            if self.no_buildings {
                return Ok(empty_collection());
            }
            Ok(collection(&[json!({
                "type": "Feature",
                "geometry": square(30.0, 60.0),
                "properties": {
                    "physical_objects": [{ "physical_object_id": 1, "building": { "floors": 4 } }]
                }
            })]))
        }

        async fn services(
            &self,
            _scenario_id: i64,
            _token: Option<&str>,
        ) -> Result<FeatureCollection, UpstreamError> {
            Ok(collection(&[json!({
                "type": "Feature",
                "geometry": square(30.001, 60.0),
                "properties": {
                    "service_id": 10,
                    "service_type": {
                        "service_type_id": 21,
                        "capacity_modeled": 50,
                        "properties": { "weight_value": 1.0 }
                    }
                }
            })]))
        }

        async fn normatives(
            &self,
            _territory_id: i64,
        ) -> Result<Vec<NormativeRecord>, UpstreamError> {
            Ok(vec![NormativeRecord {
                service_type: ServiceTypeId(21),
                capacity_per_1000: Some(100.0),
                time_availability_minutes: Some(10.0),
            }])
        }

        async fn physical_objects(
            &self,
            _scenario_id: i64,
            _object_types: &[i64],
            _token: Option<&str>,
        ) -> Result<FeatureCollection, UpstreamError> {
            Ok(empty_collection())
        }
    }

    struct TempDir(PathBuf);

    impl Drop for TempDir {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.0).ok();
        }
    }

    fn state(name: &str, source: Arc<FakeSource>) -> (TempDir, web::Data<AppState>) {
        let dir = std::env::temp_dir().join(format!("sirtep_server_{name}"));
        std::fs::remove_dir_all(&dir).ok();

        let mut config = SirtepConfig::embedded().unwrap();
        config.cache.root.clone_from(&dir);
        let orchestrator = Orchestrator::new(&config, source, Arc::new(AreaBudgetOptimizer));

        (
            TempDir(dir),
            web::Data::new(AppState {
                orchestrator: Arc::new(orchestrator),
            }),
        )
    }

    const QUERY: &str = "scenarioId=7&profileId=2&periods=2&maxAreaPerPeriod=100000";

    #[actix_web::test]
    async fn health_reports_version() {
        let app = test::init_service(App::new().configure(configure)).await;
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[actix_web::test]
    async fn provision_starts_then_completes() {
        let source = Arc::new(FakeSource::default());
        let (_dir, state) = state("complete", Arc::clone(&source));
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/provision?{QUERY}"))
            .insert_header((header::AUTHORIZATION, "Bearer secret"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["message"], sirtep_orchestrator::STARTING_DETAIL);
        assert_eq!(
            source.tokens.lock().unwrap().as_slice(),
            &[Some("secret".to_string())]
        );

        let mut completed = None;
        for _ in 0..200 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/provision/status?{QUERY}"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            if resp.status() == StatusCode::OK {
                completed = Some(test::read_body_json::<Value, _>(resp).await);
                break;
            }
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let body = completed.expect("computation did not finish");
        assert_eq!(body["status"], "completed");
        assert_eq!(body["provision"]["periods"], 2);
        assert!(body["provision"]["provision"][0]["21"].is_u64());
        assert_eq!(body["schedule"]["periods"][0]["housesBuilt"], 1);

        let req = test::TestRequest::get()
            .uri(&format!("/api/provision?{QUERY}"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn rejects_unknown_profile_and_zero_periods() {
        let (_dir, state) = state("invalid", Arc::new(FakeSource::default()));
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        for query in [
            "scenarioId=7&profileId=42&periods=2&maxAreaPerPeriod=100",
            "scenarioId=7&profileId=2&periods=0&maxAreaPerPeriod=100",
            "scenarioId=7&profileId=2",
        ] {
            let req = test::TestRequest::get()
                .uri(&format!("/api/provision?{query}"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{query}");
        }
    }

    #[actix_web::test]
    async fn status_of_unknown_computation_is_not_found() {
        let (_dir, state) = state("unknown", Arc::new(FakeSource::default()));
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/provision/status?{QUERY}"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/cache?{QUERY}"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn failed_computation_is_reported() {
        let source = Arc::new(FakeSource {
            no_buildings: true,
            ..FakeSource::default()
        });
        let (_dir, state) = state("failed", source);
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/provision?{QUERY}"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("No living buildings"));

        let req = test::TestRequest::get()
            .uri(&format!("/api/provision/status?{QUERY}"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "failed");
        assert!(body["message"].as_str().unwrap().contains("No living buildings"));
    }

    #[::core::prelude::v1::test]
    fn upstream_auth_errors_keep_their_status() {
        let e = OrchestratorError::Upstream(UpstreamError::Status {
            url: "http://upstream/api/v1/scenarios/7".to_string(),
            status: 403,
            retries: 0,
        });
        assert_eq!(status_code(&e), StatusCode::FORBIDDEN);

        let e = OrchestratorError::Upstream(UpstreamError::Status {
            url: "http://upstream/api/v1/scenarios/7".to_string(),
            status: 503,
            retries: 3,
        });
        assert_eq!(status_code(&e), StatusCode::BAD_GATEWAY);
    }
}
