#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Construction scheduling.
//!
//! A [`ScheduleOptimizer`] assigns each schedulable item a period in
//! `0..periods` (or leaves it unbuilt). The optimizer is synchronous and
//! may be CPU-bound; callers run it on a blocking thread.
//! [`AreaBudgetOptimizer`] is the built-in baseline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sirtep_provision_models::{Building, EntityKind, PhysicalObject, Service};

/// Errors from schedule optimization.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    /// Zero periods were requested.
    #[error("At least one period is required")]
    NoPeriods,

    /// An item has a negative or non-numeric area.
    #[error("{kind} {id} has invalid area {area}")]
    InvalidArea {
        /// Item kind.
        kind: EntityKind,
        /// Item id.
        id: i64,
        /// The value.
        area: f64,
    },

    /// An external optimizer failed.
    #[error("Optimizer failed: {0}")]
    Optimizer(String),
}

/// One item to schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    /// Item kind.
    pub kind: EntityKind,
    /// Upstream id.
    pub id: i64,
    /// Area consumed from the period budget, m².
    pub area: f64,
    /// Lower values are built first.
    pub priority: usize,
}

/// Optimizer input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInput {
    /// Items to schedule.
    pub items: Vec<ScheduleItem>,
    /// Number of periods.
    pub periods: u32,
    /// Area budget per period, m².
    pub max_area_per_period: u64,
}

impl ScheduleInput {
    /// Builds the input for a parsed project.
    ///
    /// Physical objects keep their profile priority; services and then
    /// buildings follow every object. A building consumes its gross floor
    /// area (footprint × floors), services and objects their footprint.
    #[must_use]
    pub fn from_project(
        buildings: &[Building],
        services: &[Service],
        objects: &[PhysicalObject],
        periods: u32,
        max_area_per_period: u64,
    ) -> Self {
        let after_objects = objects.iter().map(|o| o.priority + 1).max().unwrap_or(0);

        let items = objects
            .iter()
            .map(|o| ScheduleItem {
                kind: EntityKind::Object,
                id: o.id.0,
                area: o.area,
                priority: o.priority,
            })
            .chain(services.iter().map(|s| ScheduleItem {
                kind: EntityKind::Service,
                id: s.id.0,
                area: s.footprint_area,
                priority: after_objects,
            }))
            .chain(buildings.iter().map(|b| ScheduleItem {
                kind: EntityKind::Building,
                id: b.id.0,
                area: b.footprint_area * b.floors,
                priority: after_objects,
            }))
            .collect();

        Self {
            items,
            periods,
            max_area_per_period,
        }
    }
}

/// Per-period totals of a schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    /// Period index.
    pub period: u32,
    /// Buildings finished in the period.
    pub houses_built: usize,
    /// Their area, m².
    pub houses_area: f64,
    /// Services opened in the period.
    pub services_built: usize,
    /// Their area, m².
    pub services_area: f64,
    /// Physical objects finished in the period.
    pub objects_built: usize,
    /// Their area, m².
    pub objects_area: f64,
}

/// Schedule summary returned to callers and cached as the response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSummary {
    /// One entry per period, in order.
    pub periods: Vec<PeriodSummary>,
    /// Items left unbuilt within the horizon.
    pub unscheduled: usize,
}

/// An item and its assigned period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledItem {
    /// The item.
    pub item: ScheduleItem,
    /// Assigned period; `None` = never built.
    pub period: Option<u32>,
}

/// Optimizer output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Number of periods.
    pub periods: u32,
    /// Every input item with its assignment.
    pub items: Vec<ScheduledItem>,
}

impl Schedule {
    fn periods_of(&self, kind: EntityKind) -> BTreeMap<i64, u32> {
        self.items
            .iter()
            .filter(|s| s.item.kind == kind)
            .filter_map(|s| s.period.map(|p| (s.item.id, p)))
            .collect()
    }

    /// Assigned period of an item, if it is built.
    #[must_use]
    pub fn built_period(&self, kind: EntityKind, id: i64) -> Option<u32> {
        self.items
            .iter()
            .find(|s| s.item.kind == kind && s.item.id == id)
            .and_then(|s| s.period)
    }

    /// Copies of `buildings` carrying their assigned periods. Buildings
    /// absent from the schedule stay unbuilt.
    #[must_use]
    pub fn apply_to_buildings(&self, buildings: &[Building]) -> Vec<Building> {
        let periods = self.periods_of(EntityKind::Building);
        buildings
            .iter()
            .map(|b| b.with_built_period(periods.get(&b.id.0).copied()))
            .collect()
    }

    /// Copies of `services` carrying their assigned periods. Services
    /// absent from the schedule stay unbuilt.
    #[must_use]
    pub fn apply_to_services(&self, services: &[Service]) -> Vec<Service> {
        let periods = self.periods_of(EntityKind::Service);
        services
            .iter()
            .map(|s| s.with_built_period(periods.get(&s.id.0).copied()))
            .collect()
    }

    /// Counts and areas per period.
    #[must_use]
    pub fn summary(&self) -> ScheduleSummary {
        let mut periods: Vec<PeriodSummary> = (0..self.periods)
            .map(|period| PeriodSummary {
                period,
                ..PeriodSummary::default()
            })
            .collect();
        let mut unscheduled = 0;

        for scheduled in &self.items {
            let Some(row) = scheduled.period.and_then(|p| periods.get_mut(p as usize)) else {
                unscheduled += 1;
                continue;
            };
            let area = scheduled.item.area;
            match scheduled.item.kind {
                EntityKind::Building => {
                    row.houses_built += 1;
                    row.houses_area += area;
                }
                EntityKind::Service => {
                    row.services_built += 1;
                    row.services_area += area;
                }
                EntityKind::Object => {
                    row.objects_built += 1;
                    row.objects_area += area;
                }
            }
        }

        ScheduleSummary {
            periods,
            unscheduled,
        }
    }
}

/// Computes construction schedules.
pub trait ScheduleOptimizer: Send + Sync {
    /// Assigns periods to `input.items`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the input is unusable or the
    /// optimization fails.
    fn optimize(&self, input: &ScheduleInput) -> Result<Schedule, ScheduleError>;
}

/// Greedy baseline: items in `(priority, kind, id)` order are packed into
/// consecutive periods under the area budget. An item larger than the
/// budget takes a period of its own; items past the horizon stay unbuilt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AreaBudgetOptimizer;

impl ScheduleOptimizer for AreaBudgetOptimizer {
    #[allow(clippy::cast_precision_loss)]
    fn optimize(&self, input: &ScheduleInput) -> Result<Schedule, ScheduleError> {
        if input.periods == 0 {
            return Err(ScheduleError::NoPeriods);
        }
        if let Some(bad) = input
            .items
            .iter()
            .find(|i| !i.area.is_finite() || i.area < 0.0)
        {
            return Err(ScheduleError::InvalidArea {
                kind: bad.kind,
                id: bad.id,
                area: bad.area,
            });
        }

        let budget = input.max_area_per_period as f64;
        let mut order: Vec<&ScheduleItem> = input.items.iter().collect();
        order.sort_by_key(|i| (i.priority, i.kind, i.id));

        let mut period = 0_u32;
        let mut used = 0.0_f64;
        let mut items = Vec::with_capacity(order.len());

        for item in order {
            if used > 0.0 && used + item.area > budget {
                period = period.saturating_add(1);
                used = 0.0;
            }
            let assigned = (period < input.periods).then_some(period);
            if assigned.is_some() {
                used += item.area;
            }
            items.push(ScheduledItem {
                item: item.clone(),
                period: assigned,
            });
        }

        let schedule = Schedule {
            periods: input.periods,
            items,
        };
        log::info!(
            "Scheduled {} items over {} periods ({} unbuilt)",
            input.items.len(),
            input.periods,
            schedule.summary().unscheduled
        );
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use sirtep_provision_models::{BuildingId, ObjectId, PlanarPoint, ServiceId, ServiceTypeId};

    use super::*;

    fn item(kind: EntityKind, id: i64, area: f64, priority: usize) -> ScheduleItem {
        ScheduleItem {
            kind,
            id,
            area,
            priority,
        }
    }

    fn input(items: Vec<ScheduleItem>, periods: u32, budget: u64) -> ScheduleInput {
        ScheduleInput {
            items,
            periods,
            max_area_per_period: budget,
        }
    }

    fn period_of(schedule: &Schedule, kind: EntityKind, id: i64) -> Option<u32> {
        schedule.built_period(kind, id)
    }

    #[test]
    fn packs_items_under_budget_in_priority_order() {
        let schedule = AreaBudgetOptimizer
            .optimize(&input(
                vec![
                    item(EntityKind::Building, 1, 60.0, 1),
                    item(EntityKind::Object, 7, 50.0, 0),
                    item(EntityKind::Service, 3, 40.0, 1),
                    item(EntityKind::Building, 2, 60.0, 1),
                ],
                5,
                100,
            ))
            .unwrap();

        assert_eq!(period_of(&schedule, EntityKind::Object, 7), Some(0));
        assert_eq!(period_of(&schedule, EntityKind::Service, 3), Some(0));
        assert_eq!(period_of(&schedule, EntityKind::Building, 1), Some(1));
        assert_eq!(period_of(&schedule, EntityKind::Building, 2), Some(2));
    }

    #[test]
    fn oversized_item_takes_its_own_period() {
        let schedule = AreaBudgetOptimizer
            .optimize(&input(
                vec![
                    item(EntityKind::Building, 1, 10.0, 0),
                    item(EntityKind::Building, 2, 500.0, 0),
                    item(EntityKind::Building, 3, 10.0, 0),
                ],
                5,
                100,
            ))
            .unwrap();

        assert_eq!(period_of(&schedule, EntityKind::Building, 1), Some(0));
        assert_eq!(period_of(&schedule, EntityKind::Building, 2), Some(1));
        assert_eq!(period_of(&schedule, EntityKind::Building, 3), Some(2));
    }

    #[test]
    fn items_past_the_horizon_stay_unbuilt() {
        let schedule = AreaBudgetOptimizer
            .optimize(&input(
                (1..=5)
                    .map(|id| item(EntityKind::Building, id, 80.0, 0))
                    .collect(),
                2,
                100,
            ))
            .unwrap();

        let summary = schedule.summary();
        assert_eq!(summary.periods.len(), 2);
        assert_eq!(summary.periods[0].houses_built, 1);
        assert_eq!(summary.periods[1].houses_built, 1);
        assert_eq!(summary.unscheduled, 3);
        assert_eq!(period_of(&schedule, EntityKind::Building, 5), None);
    }

    #[test]
    fn zero_periods_is_an_error() {
        let err = AreaBudgetOptimizer.optimize(&input(vec![], 0, 100)).unwrap_err();
        assert_eq!(err, ScheduleError::NoPeriods);
    }

    #[test]
    fn negative_area_is_rejected() {
        let err = AreaBudgetOptimizer
            .optimize(&input(vec![item(EntityKind::Service, 9, -1.0, 0)], 1, 100))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidArea { id: 9, .. }));
    }

    #[test]
    fn summary_counts_kinds_and_areas() {
        let schedule = AreaBudgetOptimizer
            .optimize(&input(
                vec![
                    item(EntityKind::Object, 1, 20.0, 0),
                    item(EntityKind::Service, 2, 30.0, 1),
                    item(EntityKind::Building, 3, 40.0, 1),
                ],
                1,
                1000,
            ))
            .unwrap();

        let row = &schedule.summary().periods[0];
        assert_eq!(
            (row.objects_built, row.services_built, row.houses_built),
            (1, 1, 1)
        );
        assert!((row.objects_area - 20.0).abs() < f64::EPSILON);
        assert!((row.services_area - 30.0).abs() < f64::EPSILON);
        assert!((row.houses_area - 40.0).abs() < f64::EPSILON);

        let json = serde_json::to_value(schedule.summary()).unwrap();
        assert_eq!(json["periods"][0]["housesBuilt"], 1);
    }

    #[test]
    fn apply_assigns_periods_without_touching_inputs() {
        let buildings = vec![
            Building {
                id: BuildingId(1),
                location: Some(PlanarPoint::new(0.0, 0.0)),
                population: 10.0,
                footprint_area: 10.0,
                floors: 2.0,
                built_period: None,
            },
            Building {
                id: BuildingId(2),
                location: None,
                population: 10.0,
                footprint_area: 10.0,
                floors: 2.0,
                built_period: None,
            },
        ];
        let services = vec![Service {
            id: ServiceId(5),
            service_type: ServiceTypeId(21),
            location: Some(PlanarPoint::new(0.0, 0.0)),
            capacity: 100.0,
            radius_m: 500.0,
            footprint_area: 30.0,
            weight: 1.0,
            built_period: None,
        }];
        let objects = vec![PhysicalObject {
            id: ObjectId(9),
            object_type: 43,
            priority: 0,
            area: 5.0,
        }];

        let input = ScheduleInput::from_project(&buildings, &services, &objects, 3, 25);
        assert_eq!(input.items.len(), 4);
        assert!(input.items.iter().any(|i| i.kind == EntityKind::Building && (i.area - 20.0).abs() < f64::EPSILON));

        let schedule = AreaBudgetOptimizer.optimize(&input).unwrap();
        let scheduled_buildings = schedule.apply_to_buildings(&buildings);
        let scheduled_services = schedule.apply_to_services(&services);

        assert_eq!(scheduled_services[0].built_period, Some(1));
        assert_eq!(scheduled_buildings[0].built_period, Some(2));
        assert_eq!(scheduled_buildings[1].built_period, None);
        assert!(buildings.iter().all(|b| b.built_period.is_none()));
    }
}
