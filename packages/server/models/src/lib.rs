#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the provision server.
//!
//! These types are serialized to JSON for the REST API. They are separate
//! from the computation types to allow independent evolution of the API
//! contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sirtep_provision_models::{ProvisionRequest, ProvisionTable, ServiceTypeId};
use sirtep_schedule::ScheduleSummary;
use sirtep_tasks::{TaskSnapshot, TaskStatus};

/// Query parameters shared by the provision, status and cache endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionQueryParams {
    /// Project scenario id.
    pub scenario_id: i64,
    /// Project profile id.
    pub profile_id: i64,
    /// Number of schedule periods.
    pub periods: u32,
    /// Area budget per period, m².
    pub max_area_per_period: u64,
}

impl From<ProvisionQueryParams> for ProvisionRequest {
    fn from(params: ProvisionQueryParams) -> Self {
        Self {
            scenario_id: params.scenario_id,
            profile_id: params.profile_id,
            periods: params.periods,
            max_area_per_period: params.max_area_per_period,
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    /// Always `true` when the server answers.
    pub healthy: bool,
    /// Server version.
    pub version: String,
}

/// Provision values of a finished computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProvision {
    /// Number of periods.
    pub periods: usize,
    /// One map per period, service type id -> percent.
    pub provision: Vec<BTreeMap<ServiceTypeId, u32>>,
}

impl From<ProvisionTable> for ApiProvision {
    fn from(table: ProvisionTable) -> Self {
        Self {
            periods: table.period_count(),
            provision: table.periods,
        }
    }
}

/// Response of a completed computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProvisionResult {
    /// Always [`TaskStatus::Completed`].
    pub status: TaskStatus,
    /// Construction schedule summary.
    pub schedule: ScheduleSummary,
    /// Provision values.
    pub provision: ApiProvision,
}

impl ApiProvisionResult {
    /// Wraps a finished schedule and provision table.
    #[must_use]
    pub fn new(schedule: ScheduleSummary, provision: ProvisionTable) -> Self {
        Self {
            status: TaskStatus::Completed,
            schedule,
            provision: provision.into(),
        }
    }
}

/// Progress of a queued, running or failed computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTaskStatus {
    /// Task status.
    pub status: TaskStatus,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    /// Current step, or the failure message.
    pub message: Option<String>,
}

impl From<TaskSnapshot> for ApiTaskStatus {
    fn from(task: TaskSnapshot) -> Self {
        Self {
            status: task.status,
            progress: task.progress,
            message: task.detail,
        }
    }
}

/// Response of `DELETE /api/cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCacheDeleted {
    /// Number of cache files removed.
    pub removed: usize,
}

/// Error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable message.
    pub error: String,
}

impl ApiError {
    /// Error with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
