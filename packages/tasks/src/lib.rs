#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Background task registry.
//!
//! A task moves `queued -> running -> completed | failed`, or straight
//! from `queued` to `failed`. The job that runs the computation owns the
//! task's [`TaskHandle`], the only way to change its state; everything
//! else reads [`TaskSnapshot`]s from the [`TaskTracker`] or subscribes to
//! a `watch` channel for updates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tokio::sync::watch;

/// Errors from task lookups and transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// No task was ever registered under the id.
    #[error("Task {id} not found")]
    NotFound {
        /// Requested id.
        id: TaskId,
    },

    /// A live, unfinished task already exists under the id.
    #[error("Task {id} is already {status}")]
    AlreadyActive {
        /// Task id.
        id: TaskId,
        /// Its current status.
        status: TaskStatus,
    },

    /// The task already finished and cannot change.
    #[error("Task {id} is {status} and can no longer change")]
    Terminal {
        /// Task id.
        id: TaskId,
        /// Terminal status.
        status: TaskStatus,
    },

    /// The operation requires a different state.
    #[error("Task {id} cannot {action} while {status}")]
    InvalidTransition {
        /// Task id.
        id: TaskId,
        /// Attempted operation.
        action: &'static str,
        /// Status at the time.
        status: TaskStatus,
    },
}

/// Task identifier, derived from the request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wraps an id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a task.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    /// Registered, preparation in progress.
    Queued,
    /// Provision computation running.
    Running,
    /// Finished; the result is in the cache.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// `completed` or `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Detail of a freshly registered task.
pub const QUEUED_DETAIL: &str = "Queued";

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    /// Step description or failure message.
    pub detail: Option<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Time of the last transition or progress update.
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    fn queued(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Queued,
            progress: 0.0,
            detail: Some(QUEUED_DETAIL.to_string()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Exclusive write access to one task.
///
/// Dropping the handle before reaching a terminal state orphans the task:
/// the tracker then reports it as failed and allows a new registration.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    tx: watch::Sender<TaskSnapshot>,
}

impl TaskHandle {
    /// Task id.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.id
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        self.tx.borrow().clone()
    }

    /// `queued -> running`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] unless the task is queued.
    pub fn start(&self) -> Result<(), TaskError> {
        self.transition("start", |snap| match snap.status {
            TaskStatus::Queued => {
                snap.status = TaskStatus::Running;
                Ok(())
            }
            _ => Err(snap.status),
        })?;
        log::info!("Task {} started", self.id);
        Ok(())
    }

    /// Raises progress to `percent`, clamped to `[0, 100]`. Lower values
    /// than the current progress are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] unless the task is running.
    pub fn set_progress(&self, percent: f64) -> Result<(), TaskError> {
        self.set_progress_with(percent, None)
    }

    /// [`Self::set_progress`] plus a step description.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] unless the task is running.
    pub fn set_progress_with(&self, percent: f64, detail: Option<String>) -> Result<(), TaskError> {
        self.transition("report progress", |snap| {
            if snap.status != TaskStatus::Running {
                return Err(snap.status);
            }
            let clamped = if percent.is_nan() {
                snap.progress
            } else {
                percent.clamp(0.0, 100.0)
            };
            snap.progress = snap.progress.max(clamped);
            if detail.is_some() {
                snap.detail = detail;
            }
            Ok(())
        })
    }

    /// Replaces the step description without touching progress.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Terminal`] if the task already finished.
    pub fn describe(&self, detail: impl Into<String>) -> Result<(), TaskError> {
        let detail = detail.into();
        self.transition("describe", |snap| {
            snap.detail = Some(detail);
            Ok(())
        })
    }

    /// `running -> completed`, progress 100.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] unless the task is running.
    pub fn complete(&self) -> Result<(), TaskError> {
        self.transition("complete", |snap| {
            if snap.status != TaskStatus::Running {
                return Err(snap.status);
            }
            snap.status = TaskStatus::Completed;
            snap.progress = 100.0;
            snap.detail = None;
            Ok(())
        })?;
        log::info!("Task {} completed", self.id);
        Ok(())
    }

    /// `queued | running -> failed` with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Terminal`] if the task already finished.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), TaskError> {
        let reason = reason.into();
        log::error!("Task {} failed: {reason}", self.id);
        self.transition("fail", |snap| {
            snap.status = TaskStatus::Failed;
            snap.detail = Some(reason);
            Ok(())
        })
    }

    /// Applies `change` unless the task is terminal. `change` returns the
    /// offending status when the transition is not allowed.
    fn transition(
        &self,
        action: &'static str,
        change: impl FnOnce(&mut TaskSnapshot) -> Result<(), TaskStatus>,
    ) -> Result<(), TaskError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|snap| {
            if snap.status.is_terminal() {
                result = Err(TaskError::Terminal {
                    id: self.id.clone(),
                    status: snap.status,
                });
                return false;
            }
            match change(snap) {
                Ok(()) => {
                    snap.updated_at = Utc::now();
                    true
                }
                Err(status) => {
                    result = Err(TaskError::InvalidTransition {
                        id: self.id.clone(),
                        action,
                        status,
                    });
                    false
                }
            }
        });
        result
    }
}

/// Registry of tasks by id.
#[derive(Debug, Default)]
pub struct TaskTracker {
    tasks: Mutex<BTreeMap<TaskId, watch::Receiver<TaskSnapshot>>>,
}

/// A non-terminal task whose handle was dropped.
fn is_orphaned(rx: &watch::Receiver<TaskSnapshot>) -> bool {
    rx.has_changed().is_err() && !rx.borrow().status.is_terminal()
}

/// Snapshot as observers should see it.
fn observe(rx: &watch::Receiver<TaskSnapshot>) -> TaskSnapshot {
    let mut snap = rx.borrow().clone();
    if is_orphaned(rx) {
        snap.status = TaskStatus::Failed;
        snap.detail = Some("Task worker exited before finishing".to_string());
    }
    snap
}

impl TaskTracker {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TaskId, watch::Receiver<TaskSnapshot>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a queued task and hands back its only handle.
    ///
    /// A finished or orphaned task under the same id is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::AlreadyActive`] while a live task with the id
    /// is queued or running.
    pub fn register(&self, id: TaskId) -> Result<TaskHandle, TaskError> {
        let mut tasks = self.lock();

        if let Some(existing) = tasks.get(&id) {
            let status = existing.borrow().status;
            if !status.is_terminal() && !is_orphaned(existing) {
                return Err(TaskError::AlreadyActive { id, status });
            }
            log::debug!("Replacing {status} task {id}");
        }

        let (tx, rx) = watch::channel(TaskSnapshot::queued(id.clone()));
        tasks.insert(id.clone(), rx);
        drop(tasks);

        log::info!("Task {id} queued");
        Ok(TaskHandle { id, tx })
    }

    /// Current snapshot of a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if the id was never registered.
    pub fn get(&self, id: &TaskId) -> Result<TaskSnapshot, TaskError> {
        self.lock()
            .get(id)
            .map(observe)
            .ok_or_else(|| TaskError::NotFound { id: id.clone() })
    }

    /// Receiver that yields every update of the task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] if the id was never registered.
    pub fn subscribe(&self, id: &TaskId) -> Result<watch::Receiver<TaskSnapshot>, TaskError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound { id: id.clone() })
    }

    /// Forgets a task, returning its last snapshot.
    pub fn remove(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.lock().remove(id).map(|rx| observe(&rx))
    }

    /// Forgets a task only if it completed, returning its last snapshot.
    /// Queued, running and failed tasks stay tracked.
    pub fn remove_completed(&self, id: &TaskId) -> Option<TaskSnapshot> {
        let mut tasks = self.lock();
        let completed = tasks
            .get(id)
            .is_some_and(|rx| observe(rx).status == TaskStatus::Completed);
        if !completed {
            return None;
        }
        let removed = tasks.remove(id).map(|rx| observe(&rx));
        drop(tasks);
        log::debug!("Forgot completed task {id}");
        removed
    }

    /// Forgets every finished or orphaned task last updated before
    /// `cutoff`. Returns how many were dropped.
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, rx| {
            let snap = observe(rx);
            !snap.status.is_terminal() || snap.updated_at >= cutoff
        });
        let evicted = before - tasks.len();
        drop(tasks);
        if evicted > 0 {
            log::info!("Evicted {evicted} finished tasks");
        }
        evicted
    }

    /// Whether a live task is queued or running under the id.
    #[must_use]
    pub fn is_active(&self, id: &TaskId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|rx| !observe(rx).status.is_terminal())
    }

    /// Number of tracked tasks, finished ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no task is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::new(s)
    }

    #[test]
    fn unknown_task_is_not_found() {
        let tracker = TaskTracker::new();
        assert_eq!(
            tracker.get(&id("nope")),
            Err(TaskError::NotFound { id: id("nope") })
        );
        assert!(tracker.subscribe(&id("nope")).is_err());
        assert!(!tracker.is_active(&id("nope")));
    }

    #[test]
    fn full_lifecycle() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        assert_eq!(tracker.get(&id("a")).unwrap().status, TaskStatus::Queued);
        assert!(tracker.is_active(&id("a")));

        handle.start().unwrap();
        handle.set_progress(40.0).unwrap();
        let snap = tracker.get(&id("a")).unwrap();
        assert_eq!(snap.status, TaskStatus::Running);
        assert!((snap.progress - 40.0).abs() < f64::EPSILON);

        handle.complete().unwrap();
        let snap = tracker.get(&id("a")).unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);
        assert!((snap.progress - 100.0).abs() < f64::EPSILON);
        assert!(!tracker.is_active(&id("a")));
    }

    #[test]
    fn terminal_tasks_never_change() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        handle.start().unwrap();
        handle.fail("boom").unwrap();

        assert!(matches!(handle.complete(), Err(TaskError::Terminal { .. })));
        assert!(matches!(handle.set_progress(50.0), Err(TaskError::Terminal { .. })));
        assert!(matches!(handle.fail("again"), Err(TaskError::Terminal { .. })));
        assert!(matches!(handle.start(), Err(TaskError::Terminal { .. })));

        let snap = tracker.get(&id("a")).unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.detail.as_deref(), Some("boom"));
    }

    #[test]
    fn queued_task_can_fail_but_not_progress() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();

        assert!(matches!(
            handle.set_progress(10.0),
            Err(TaskError::InvalidTransition { .. })
        ));
        assert!(matches!(
            handle.complete(),
            Err(TaskError::InvalidTransition { .. })
        ));
        handle.fail("upstream unavailable").unwrap();
        assert_eq!(tracker.get(&id("a")).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn start_twice_is_rejected() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        handle.start().unwrap();
        assert!(matches!(
            handle.start(),
            Err(TaskError::InvalidTransition {
                status: TaskStatus::Running,
                ..
            })
        ));
    }

    #[test]
    fn progress_is_clamped_and_non_decreasing() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        handle.start().unwrap();

        handle.set_progress(-5.0).unwrap();
        assert!(tracker.get(&id("a")).unwrap().progress.abs() < f64::EPSILON);

        handle.set_progress(60.0).unwrap();
        handle.set_progress(30.0).unwrap();
        handle.set_progress(f64::NAN).unwrap();
        assert!((tracker.get(&id("a")).unwrap().progress - 60.0).abs() < f64::EPSILON);

        handle.set_progress(250.0).unwrap();
        assert!((tracker.get(&id("a")).unwrap().progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn at_most_one_live_task_per_id() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();

        assert!(matches!(
            tracker.register(id("a")),
            Err(TaskError::AlreadyActive {
                status: TaskStatus::Queued,
                ..
            })
        ));
        assert!(tracker.register(id("b")).is_ok());

        handle.start().unwrap();
        handle.complete().unwrap();
        let again = tracker.register(id("a")).unwrap();
        assert_eq!(again.snapshot().status, TaskStatus::Queued);
        assert_eq!(tracker.get(&id("a")).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn dropped_handle_orphans_the_task() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        handle.start().unwrap();
        drop(handle);

        let snap = tracker.get(&id("a")).unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(snap.detail.is_some());
        assert!(!tracker.is_active(&id("a")));
        assert!(tracker.register(id("a")).is_ok());
    }

    #[test]
    fn finished_task_keeps_its_state_after_handle_drop() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        handle.start().unwrap();
        handle.complete().unwrap();
        drop(handle);

        assert_eq!(tracker.get(&id("a")).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn remove_forgets_the_task() {
        let tracker = TaskTracker::new();
        let _handle = tracker.register(id("a")).unwrap();
        assert_eq!(tracker.len(), 1);

        let last = tracker.remove(&id("a")).unwrap();
        assert_eq!(last.status, TaskStatus::Queued);
        assert!(tracker.is_empty());
        assert!(matches!(
            tracker.get(&id("a")),
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn subscribers_see_every_transition_in_order() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        let mut rx = tracker.subscribe(&id("a")).unwrap();

        let worker = tokio::spawn(async move {
            handle.start().unwrap();
            for p in [10.0, 20.0, 55.0, 90.0] {
                handle.set_progress(p).unwrap();
                tokio::task::yield_now().await;
            }
            handle.complete().unwrap();
        });

        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let snap = rx.borrow_and_update().clone();
            seen.push(snap.progress);
            if snap.status.is_terminal() {
                assert_eq!(snap.status, TaskStatus::Completed);
                break;
            }
        }
        worker.await.unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert!((seen.last().copied().unwrap() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let tracker = TaskTracker::new();
        let _handle = tracker.register(id("abc")).unwrap();
        let json = serde_json::to_value(tracker.get(&id("abc")).unwrap()).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["status"], "queued");
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn status_names_agree_between_serde_and_strum() {
        for status in TaskStatus::iter() {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_ref());
            assert_eq!(status.to_string().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!(TaskStatus::iter().filter(|s| s.is_terminal()).count(), 2);
    }

    #[test]
    fn queued_task_has_a_detail_until_described() {
        let tracker = TaskTracker::new();
        let handle = tracker.register(id("a")).unwrap();
        assert_eq!(handle.snapshot().detail.as_deref(), Some(QUEUED_DETAIL));

        handle.describe("Fetching project").unwrap();
        let snap = tracker.get(&id("a")).unwrap();
        assert_eq!(snap.status, TaskStatus::Queued);
        assert_eq!(snap.detail.as_deref(), Some("Fetching project"));

        handle.start().unwrap();
        handle.set_progress(30.0).unwrap();
        handle.describe("Period 1/3").unwrap();
        let snap = tracker.get(&id("a")).unwrap();
        assert!((snap.progress - 30.0).abs() < f64::EPSILON);
        assert_eq!(snap.detail.as_deref(), Some("Period 1/3"));

        handle.complete().unwrap();
        assert!(matches!(
            handle.describe("late"),
            Err(TaskError::Terminal { .. })
        ));
    }

    #[test]
    fn only_completed_tasks_are_removed_on_delivery() {
        let tracker = TaskTracker::new();
        let running = tracker.register(id("running")).unwrap();
        running.start().unwrap();
        let failed = tracker.register(id("failed")).unwrap();
        failed.fail("boom").unwrap();
        let done = tracker.register(id("done")).unwrap();
        done.start().unwrap();
        done.complete().unwrap();

        assert!(tracker.remove_completed(&id("running")).is_none());
        assert!(tracker.remove_completed(&id("failed")).is_none());
        assert!(tracker.remove_completed(&id("missing")).is_none());
        let last = tracker.remove_completed(&id("done")).unwrap();
        assert_eq!(last.status, TaskStatus::Completed);

        assert_eq!(tracker.len(), 2);
        assert!(tracker.get(&id("done")).is_err());
    }

    #[test]
    fn old_finished_tasks_are_evicted() {
        let tracker = TaskTracker::new();
        let live = tracker.register(id("live")).unwrap();
        live.start().unwrap();
        let failed = tracker.register(id("failed")).unwrap();
        failed.fail("boom").unwrap();
        let orphan = tracker.register(id("orphan")).unwrap();
        drop(orphan);

        let now = Utc::now();
        assert_eq!(tracker.evict_finished_before(now - chrono::Duration::hours(1)), 0);
        assert_eq!(tracker.len(), 3);

        assert_eq!(tracker.evict_finished_before(now + chrono::Duration::seconds(1)), 2);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_active(&id("live")));
    }
}
