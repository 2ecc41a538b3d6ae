#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Start-or-fetch orchestration.
//!
//! A request first resolves the scenario's upstream version. A current
//! cached result is returned directly. Otherwise a task is registered,
//! the project is fetched, parsed, scheduled and turned into an
//! accessibility matrix, and the provision computation is spawned as a
//! detached job whose progress is visible through the task tracker. At
//! most one computation runs per request fingerprint.

pub mod progress;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use sirtep_cache::{ArtifactKind, CacheError, CacheKey, CacheStore, SweepReport};
use sirtep_config::{ParsingConfig, ProfileMap, SirtepConfig};
use sirtep_matrix::{AccessibilityMatrix, MatrixBuilder, MatrixError};
use sirtep_provision::{ProvisionEngine, ProvisionError, ProvisionInput};
use sirtep_provision_models::{
    Building, ProvisionRequest, ProvisionTable, Service, ServiceTypeId,
};
use sirtep_schedule::{ScheduleError, ScheduleInput, ScheduleOptimizer, ScheduleSummary};
use sirtep_tasks::{TaskError, TaskHandle, TaskId, TaskSnapshot, TaskStatus, TaskTracker};
use sirtep_urban_api::{
    ProjectDataSource, ProjectParser, RawProject, ScenarioInfo, UpstreamError, fetch_project,
};
use tokio::task::JoinHandle;

use crate::progress::TaskProgress;

/// Task detail while the project is fetched, parsed and scheduled.
pub const PREPARING_DETAIL: &str = "Preparing project data";

/// Task detail between preparation and the provision job picking it up.
pub const STARTING_DETAIL: &str = "Starting provision computation";

/// Upper bound on the cache actuality window (100 years).
const MAX_ACTUALITY_HOURS: i64 = 24 * 365 * 100;

/// Errors from orchestration.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Request parameters are out of range.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The profile has no configured object priorities.
    #[error("Unknown profile {profile_id}")]
    UnknownProfile {
        /// Requested profile.
        profile_id: i64,
    },

    /// No computation was ever started for the parameters.
    #[error("No computation found for {fingerprint}")]
    NotStarted {
        /// Request fingerprint.
        fingerprint: String,
    },

    /// Upstream data could not be fetched or parsed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The optimizer failed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The matrix could not be built.
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    /// The provision computation failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Cache I/O failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Task registry error.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// A blocking worker panicked or was cancelled.
    #[error("Worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a start-or-fetch or poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    /// The result is available.
    Completed {
        /// Schedule summary.
        schedule: ScheduleSummary,
        /// Provision per period and service type.
        provision: ProvisionTable,
    },
    /// A computation is queued or running.
    InProgress {
        /// Its current state.
        task: TaskSnapshot,
    },
    /// The last computation failed.
    Failed {
        /// Its final state, with the failure message.
        task: TaskSnapshot,
    },
}

/// Everything the provision job needs, built before it is spawned.
struct Prepared {
    buildings: Vec<Building>,
    services: Vec<Service>,
    service_types: Vec<ServiceTypeId>,
    matrix: AccessibilityMatrix,
}

/// Coordinates upstream fetches, scheduling, caching and provision jobs.
pub struct Orchestrator {
    source: Arc<dyn ProjectDataSource>,
    optimizer: Arc<dyn ScheduleOptimizer>,
    cache: CacheStore,
    tasks: TaskTracker,
    parsing: ParsingConfig,
    profiles: ProfileMap,
    sweep_interval: Duration,
}

impl Orchestrator {
    /// Creates an orchestrator over `source` and `optimizer`.
    #[must_use]
    pub fn new(
        config: &SirtepConfig,
        source: Arc<dyn ProjectDataSource>,
        optimizer: Arc<dyn ScheduleOptimizer>,
    ) -> Self {
        let hours = i64::try_from(config.cache.actuality_hours)
            .unwrap_or(MAX_ACTUALITY_HOURS)
            .min(MAX_ACTUALITY_HOURS);
        let actuality = chrono::Duration::hours(hours);
        Self {
            source,
            optimizer,
            cache: CacheStore::new(config.cache.root.clone(), actuality),
            tasks: TaskTracker::new(),
            parsing: config.parsing,
            profiles: config.profiles.clone(),
            sweep_interval: config.cache.sweep_interval(),
        }
    }

    /// Task registry.
    #[must_use]
    pub const fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Artifact cache.
    #[must_use]
    pub const fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Task id used for `request`.
    #[must_use]
    pub fn task_id(request: &ProvisionRequest) -> TaskId {
        TaskId::new(CacheKey::from(request).fingerprint())
    }

    fn validate(&self, request: &ProvisionRequest) -> Result<&[i64], OrchestratorError> {
        if request.periods == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "periods must be at least 1".to_string(),
            ));
        }
        self.profiles
            .get(request.profile_id)
            .ok_or(OrchestratorError::UnknownProfile {
                profile_id: request.profile_id,
            })
    }

    /// Returns the cached result, the running task, or starts a new
    /// computation.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] for invalid requests, upstream
    /// failures, preparation failures (the task is marked failed) and
    /// cache I/O errors.
    pub async fn start_or_fetch(
        &self,
        request: ProvisionRequest,
        token: Option<&str>,
    ) -> Result<ProvisionOutcome, OrchestratorError> {
        let priorities = self.validate(&request)?.to_vec();
        let key = CacheKey::from(&request);
        let id = TaskId::new(key.fingerprint());

        if let Some(task) = self.in_flight(&id) {
            log::debug!("Task {id} already in flight");
            return Ok(ProvisionOutcome::InProgress { task });
        }

        let scenario = self.source.scenario_info(request.scenario_id, token).await?;
        if let Some(outcome) = self.cached(&key, &scenario.version)? {
            log::info!(
                "Serving cached provision for scenario {} @ {}",
                request.scenario_id,
                scenario.version
            );
            self.tasks.remove_completed(&id);
            return Ok(outcome);
        }

        let handle = match self.tasks.register(id.clone()) {
            Ok(handle) => handle,
            Err(TaskError::AlreadyActive { .. }) => {
                return Ok(ProvisionOutcome::InProgress {
                    task: self.tasks.get(&id)?,
                });
            }
            Err(e) => return Err(e.into()),
        };
        handle.describe(PREPARING_DETAIL)?;

        let prepared = match self.prepare(request, &key, &scenario, &priorities, token).await {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(task_err) = handle.fail(e.to_string()) {
                    log::warn!("Could not mark task {id} failed: {task_err}");
                }
                return Err(e);
            }
        };

        handle.describe(STARTING_DETAIL)?;
        let task = handle.snapshot();

        tokio::spawn(run_provision(
            handle,
            self.cache.clone(),
            key,
            scenario.version,
            request.periods,
            prepared,
        ));

        Ok(ProvisionOutcome::InProgress { task })
    }

    /// Snapshot of the task under `id` while it is queued or running.
    fn in_flight(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.tasks
            .get(id)
            .ok()
            .filter(|task| !task.status.is_terminal())
    }

    /// Fetches, parses, schedules and builds the matrix; caches the matrix
    /// and the schedule summary.
    async fn prepare(
        &self,
        request: ProvisionRequest,
        key: &CacheKey,
        scenario: &ScenarioInfo,
        priorities: &[i64],
        token: Option<&str>,
    ) -> Result<Prepared, OrchestratorError> {
        let raw = fetch_project(self.source.as_ref(), scenario, priorities, token).await?;

        let job = PrepareJob {
            parser: ProjectParser::new(self.parsing),
            optimizer: Arc::clone(&self.optimizer),
            cache: self.cache.clone(),
            key: *key,
            version: scenario.version.clone(),
            priorities: priorities.to_vec(),
        };

        tokio::task::spawn_blocking(move || job.run(&raw, request)).await?
    }

    /// Returns the result if it is cached, or the state of the task for
    /// `request`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotStarted`] if nothing was ever
    /// computed or started for the parameters, or a cache error.
    pub fn poll(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome, OrchestratorError> {
        self.validate(request)?;
        let key = CacheKey::from(request);
        let id = TaskId::new(key.fingerprint());

        match self.tasks.get(&id) {
            Ok(task) => match task.status {
                TaskStatus::Queued | TaskStatus::Running => {
                    return Ok(ProvisionOutcome::InProgress { task });
                }
                TaskStatus::Failed => return Ok(ProvisionOutcome::Failed { task }),
                TaskStatus::Completed => {}
            },
            Err(TaskError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(version) = self.cache.latest_version(ArtifactKind::Provision, &key)? {
            if let Some(outcome) = self.cached(&key, &version)? {
                self.tasks.remove_completed(&id);
                return Ok(outcome);
            }
        }

        Err(OrchestratorError::NotStarted {
            fingerprint: key.fingerprint(),
        })
    }

    /// Drops every cached artifact for `request`. A finished task for the
    /// parameters is forgotten too.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Cache`] with [`CacheError::NotFound`]
    /// if nothing was cached.
    pub fn invalidate(&self, request: &ProvisionRequest) -> Result<usize, OrchestratorError> {
        let key = CacheKey::from(request);
        let id = TaskId::new(key.fingerprint());
        if !self.tasks.is_active(&id) {
            self.tasks.remove(&id);
        }
        Ok(self.cache.delete_all(&key)?)
    }

    /// Deletes cache entries older than the actuality window and forgets
    /// finished tasks that have not changed within it.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Cache`] if entries could not be
    /// listed or deleted.
    pub async fn sweep_cache(&self) -> Result<SweepReport, OrchestratorError> {
        let cache = self.cache.clone();
        let max_age = cache.actuality();
        self.tasks.evict_finished_before(Utc::now() - max_age);
        Ok(tokio::task::spawn_blocking(move || cache.sweep(max_age)).await??)
    }

    /// Runs [`Self::sweep_cache`] every configured interval until the
    /// runtime shuts down.
    #[must_use]
    pub fn spawn_cache_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.sweep_interval);
            loop {
                interval.tick().await;
                match this.sweep_cache().await {
                    Ok(report) => log::debug!("Cache sweep: {report:?}"),
                    Err(e) => log::error!("Cache sweep failed: {e}"),
                }
            }
        })
    }

    fn cached(
        &self,
        key: &CacheKey,
        version: &str,
    ) -> Result<Option<ProvisionOutcome>, OrchestratorError> {
        let Some(provision) = self
            .cache
            .read_if_current::<ProvisionTable>(ArtifactKind::Provision, key, version)?
        else {
            return Ok(None);
        };
        let Some(schedule) = self
            .cache
            .read_if_current::<ScheduleSummary>(ArtifactKind::Response, key, version)?
        else {
            return Ok(None);
        };
        Ok(Some(ProvisionOutcome::Completed {
            schedule,
            provision,
        }))
    }
}

/// Blocking half of preparation: parse, schedule, build the matrix.
struct PrepareJob {
    parser: ProjectParser,
    optimizer: Arc<dyn ScheduleOptimizer>,
    cache: CacheStore,
    key: CacheKey,
    version: String,
    priorities: Vec<i64>,
}

impl PrepareJob {
    fn run(&self, raw: &RawProject, request: ProvisionRequest) -> Result<Prepared, OrchestratorError> {
        let parsed = self.parser.parse(raw, &self.priorities)?;

        let input = ScheduleInput::from_project(
            &parsed.buildings,
            &parsed.services,
            &parsed.objects,
            request.periods,
            request.max_area_per_period,
        );
        let schedule = self.optimizer.optimize(&input)?;
        let buildings = schedule.apply_to_buildings(&parsed.buildings);
        let services = schedule.apply_to_services(&parsed.services);

        let build = MatrixBuilder::build(&buildings, &services)?;
        log::info!(
            "Scenario {}: {} accessible pairs within {:.0} m",
            request.scenario_id,
            build.matrix.pairs().count(),
            build.max_radius
        );

        self.cache
            .write(ArtifactKind::Matrix, &self.key, &self.version, &build.matrix)?;
        self.cache
            .write(ArtifactKind::Response, &self.key, &self.version, &schedule.summary())?;

        Ok(Prepared {
            service_types: parsed.service_types(),
            buildings,
            services,
            matrix: build.matrix,
        })
    }
}

/// The detached provision job. Owns the task handle until the task is
/// terminal.
async fn run_provision(
    handle: TaskHandle,
    cache: CacheStore,
    key: CacheKey,
    version: String,
    periods: u32,
    prepared: Prepared,
) {
    if let Err(e) = handle.start() {
        log::error!("Cannot start provision task: {e}");
        return;
    }
    let handle = Arc::new(handle);
    let progress = TaskProgress::new(Arc::clone(&handle));

    let result = tokio::task::spawn_blocking(move || -> Result<(), OrchestratorError> {
        let table = ProvisionEngine::new(ProvisionInput {
            buildings: &prepared.buildings,
            services: &prepared.services,
            matrix: &prepared.matrix,
            periods,
            service_types: &prepared.service_types,
        })
        .compute(&progress)?;
        cache.write(ArtifactKind::Provision, &key, &version, &table)?;
        Ok(())
    })
    .await;

    let finished = match result {
        Ok(Ok(())) => handle.complete(),
        Ok(Err(e)) => handle.fail(e.to_string()),
        Err(e) => handle.fail(format!("Provision worker failed: {e}")),
    };
    if let Err(e) = finished {
        log::error!("Could not finish task {}: {e}", handle.id());
    }
}
