#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Period-phased provision calculation.
//!
//! For every period `p` and requested service type `t`, provision is the
//! capacity of the type-`t` services that some built building can reach,
//! divided by the population of the built buildings that reach at least
//! one of them, as a rounded percentage. Only pairs whose building and
//! service are both built by `p` count.
//!
//! Built sets only grow with `p`, so each type keeps a cursor over its
//! accessible pairs sorted by the period in which they become active and
//! accumulates demand and capacity as periods advance.

pub mod progress;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use sirtep_matrix::AccessibilityMatrix;
use sirtep_provision_models::{
    Building, BuildingId, ProvisionTable, Service, ServiceId, ServiceTypeId,
};

use crate::progress::ProgressCallback;

/// Errors from the provision computation.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Zero periods were requested.
    #[error("At least one period is required")]
    NoPeriods,

    /// A building population is negative or not a number.
    #[error("Building {building} has invalid population {population}")]
    InvalidPopulation {
        /// Offending building.
        building: BuildingId,
        /// The value.
        population: f64,
    },

    /// A service capacity is negative or not a number.
    #[error("Service {service} has invalid capacity {capacity}")]
    InvalidCapacity {
        /// Offending service.
        service: ServiceId,
        /// The value.
        capacity: f64,
    },
}

/// Everything the engine reads. Built-periods come from the entities.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionInput<'a> {
    /// Scheduled buildings.
    pub buildings: &'a [Building],
    /// Scheduled services.
    pub services: &'a [Service],
    /// Binary accessibility between them.
    pub matrix: &'a AccessibilityMatrix,
    /// Number of periods to evaluate (`0..periods`).
    pub periods: u32,
    /// Service types to evaluate, in output order.
    pub service_types: &'a [ServiceTypeId],
}

/// Demand and capacity behind one provision cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CellTotals {
    /// Population of built buildings reaching at least one service.
    pub demand: f64,
    /// Capacity of built services reached by at least one building.
    pub capacity: f64,
}

/// Provision table plus the totals it was computed from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionReport {
    /// Rounded percentages.
    pub table: ProvisionTable,
    /// Totals per period and type.
    pub totals: Vec<BTreeMap<ServiceTypeId, CellTotals>>,
}

/// One accessible pair and the first period in which both ends exist.
struct ActivePair {
    active_from: u32,
    building: BuildingId,
    service: ServiceId,
}

/// Running totals for one service type.
struct TypeAccumulator {
    pairs: Vec<ActivePair>,
    cursor: usize,
    first_built: Option<u32>,
    buildings: BTreeSet<BuildingId>,
    services: BTreeSet<ServiceId>,
    totals: CellTotals,
}

impl TypeAccumulator {
    /// Adds every pair that becomes active by `period`.
    fn advance(
        &mut self,
        period: u32,
        population: &BTreeMap<BuildingId, f64>,
        capacity: &BTreeMap<ServiceId, f64>,
    ) {
        while let Some(pair) = self.pairs.get(self.cursor) {
            if pair.active_from > period {
                break;
            }
            if self.buildings.insert(pair.building) {
                self.totals.demand += population.get(&pair.building).copied().unwrap_or(0.0);
            }
            if self.services.insert(pair.service) {
                self.totals.capacity += capacity.get(&pair.service).copied().unwrap_or(0.0);
            }
            self.cursor += 1;
        }
    }
}

/// Computes provision tables.
pub struct ProvisionEngine<'a> {
    input: ProvisionInput<'a>,
}

impl<'a> ProvisionEngine<'a> {
    /// Creates an engine over `input`.
    #[must_use]
    pub const fn new(input: ProvisionInput<'a>) -> Self {
        Self { input }
    }

    /// Computes the provision table, reporting progress after each period.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] if no period was requested or an input
    /// population/capacity is invalid.
    pub fn compute(&self, progress: &dyn ProgressCallback) -> Result<ProvisionTable, ProvisionError> {
        self.compute_detailed(progress).map(|report| report.table)
    }

    /// Like [`Self::compute`] but also returns the demand/capacity totals.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] if no period was requested or an input
    /// population/capacity is invalid.
    pub fn compute_detailed(
        &self,
        progress: &dyn ProgressCallback,
    ) -> Result<ProvisionReport, ProvisionError> {
        let start = Instant::now();
        let ProvisionInput {
            periods,
            service_types,
            ..
        } = self.input;

        if periods == 0 {
            return Err(ProvisionError::NoPeriods);
        }

        let population = self.populations()?;
        let capacity = self.capacities()?;
        let mut accumulators = self.accumulators();

        let types = service_types.len() as u64;
        progress.set_total(u64::from(periods) * types.max(1));

        let mut table = Vec::with_capacity(periods as usize);
        let mut totals = Vec::with_capacity(periods as usize);

        for period in 0..periods {
            let mut row = BTreeMap::new();
            let mut row_totals = BTreeMap::new();

            for service_type in service_types {
                let (value, cell) = accumulators.get_mut(service_type).map_or(
                    (0, CellTotals::default()),
                    |acc| {
                        if acc.first_built.is_none_or(|first| first > period) {
                            return (0, CellTotals::default());
                        }
                        acc.advance(period, &population, &capacity);
                        (provision_percent(acc.totals), acc.totals)
                    },
                );
                row.insert(*service_type, value);
                row_totals.insert(*service_type, cell);
            }

            log::debug!("Period {period}: {row:?}");
            table.push(row);
            totals.push(row_totals);

            progress.set_position(u64::from(period + 1) * types.max(1));
            progress.set_message(format!("Period {}/{periods}", period + 1));
        }

        log::info!(
            "Provision for {periods} periods x {} service types computed in {:?}",
            service_types.len(),
            start.elapsed()
        );

        Ok(ProvisionReport {
            table: ProvisionTable::new(table),
            totals,
        })
    }

    fn populations(&self) -> Result<BTreeMap<BuildingId, f64>, ProvisionError> {
        self.input
            .buildings
            .iter()
            .map(|b| {
                if b.population.is_finite() && b.population >= 0.0 {
                    Ok((b.id, b.population))
                } else {
                    Err(ProvisionError::InvalidPopulation {
                        building: b.id,
                        population: b.population,
                    })
                }
            })
            .collect()
    }

    fn capacities(&self) -> Result<BTreeMap<ServiceId, f64>, ProvisionError> {
        self.input
            .services
            .iter()
            .map(|s| {
                if s.capacity.is_finite() && s.capacity >= 0.0 {
                    Ok((s.id, s.capacity))
                } else {
                    Err(ProvisionError::InvalidCapacity {
                        service: s.id,
                        capacity: s.capacity,
                    })
                }
            })
            .collect()
    }

    /// Groups accessible pairs by service type, dropping pairs whose
    /// building or service is never built or unknown to this input.
    fn accumulators(&self) -> BTreeMap<ServiceTypeId, TypeAccumulator> {
        let building_periods: BTreeMap<BuildingId, u32> = self
            .input
            .buildings
            .iter()
            .filter_map(|b| b.built_period.map(|p| (b.id, p)))
            .collect();
        let services: BTreeMap<ServiceId, &Service> =
            self.input.services.iter().map(|s| (s.id, s)).collect();

        let mut accumulators: BTreeMap<ServiceTypeId, TypeAccumulator> = self
            .input
            .service_types
            .iter()
            .map(|t| {
                (
                    *t,
                    TypeAccumulator {
                        pairs: Vec::new(),
                        cursor: 0,
                        first_built: None,
                        buildings: BTreeSet::new(),
                        services: BTreeSet::new(),
                        totals: CellTotals::default(),
                    },
                )
            })
            .collect();

        for service in self.input.services {
            if let (Some(acc), Some(p)) = (
                accumulators.get_mut(&service.service_type),
                service.built_period,
            ) {
                acc.first_built = Some(acc.first_built.map_or(p, |first| first.min(p)));
            }
        }

        for (building, service_id) in self.input.matrix.pairs() {
            let (Some(building_period), Some(service)) =
                (building_periods.get(&building), services.get(&service_id))
            else {
                continue;
            };
            let (Some(service_period), Some(acc)) = (
                service.built_period,
                accumulators.get_mut(&service.service_type),
            ) else {
                continue;
            };
            acc.pairs.push(ActivePair {
                active_from: (*building_period).max(service_period),
                building,
                service: service_id,
            });
        }

        for acc in accumulators.values_mut() {
            acc.pairs.sort_by_key(|p| (p.active_from, p.building, p.service));
        }

        accumulators
    }
}

/// `round(capacity / demand * 100)`, or 0 when nothing is reachable or
/// there is no population to serve.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn provision_percent(totals: CellTotals) -> u32 {
    if totals.demand <= 0.0 || !totals.demand.is_finite() {
        return 0;
    }
    let value = (totals.capacity / totals.demand * 100.0).round();
    if value.is_finite() && value >= 0.0 {
        value.min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}
