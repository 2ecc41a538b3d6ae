#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for service provision computations.
//!
//! `GET /api/provision` starts a computation or returns its cached
//! result, `GET /api/provision/status` polls it and `DELETE /api/cache`
//! drops cached artifacts. A background task sweeps expired cache files.

mod handlers;

use std::path::Path;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use sirtep_config::{ConfigError, SirtepConfig};
use sirtep_orchestrator::Orchestrator;
use sirtep_schedule::AreaBudgetOptimizer;
use sirtep_urban_api::{UpstreamError, UrbanApiClient};

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The upstream client could not be built.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Binding or serving failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared application state.
pub struct AppState {
    /// Computation coordinator.
    pub orchestrator: Arc<Orchestrator>,
}

/// Registers the `/api` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/provision", web::get().to(handlers::provision))
            .route("/provision/status", web::get().to(handlers::provision_status))
            .route("/cache", web::delete().to(handlers::delete_cache)),
    );
}

/// Starts the provision API server.
///
/// Loads configuration from `config_path` (or the embedded defaults) with
/// environment overrides, builds the upstream client and the
/// orchestrator, spawns the cache sweeper and serves until shutdown. The
/// caller provides the async runtime (e.g. via `#[actix_web::main]`).
///
/// # Errors
///
/// Returns [`ServerError`] if the configuration is invalid, the HTTP
/// client cannot be built, or the server fails to bind or run.
#[allow(clippy::future_not_send)]
pub async fn run_server(config_path: Option<&Path>) -> Result<(), ServerError> {
    let config = SirtepConfig::load(config_path)?;

    log::info!("Using urban API at {}", config.urban_api.base_url);
    let client = UrbanApiClient::new(&config.urban_api)?;

    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        Arc::new(client),
        Arc::new(AreaBudgetOptimizer),
    ));
    log::info!(
        "Caching under {} for {}h",
        config.cache.root.display(),
        config.cache.actuality_hours
    );
    let sweeper = orchestrator.spawn_cache_sweeper();

    let state = web::Data::new(AppState { orchestrator });
    let bind_addr = config.server.bind_addr.clone();
    let port = config.server.port;

    log::info!("Starting server on {bind_addr}:{port}");

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await;

    sweeper.abort();
    Ok(result?)
}
