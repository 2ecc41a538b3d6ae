//! Forwards provision progress to the task record.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sirtep_provision::progress::ProgressCallback;
use sirtep_tasks::TaskHandle;

/// [`ProgressCallback`] that reports percent complete to a task.
pub struct TaskProgress {
    handle: Arc<TaskHandle>,
    total: AtomicU64,
}

impl TaskProgress {
    /// Reports to `handle`.
    #[must_use]
    pub const fn new(handle: Arc<TaskHandle>) -> Self {
        Self {
            handle,
            total: AtomicU64::new(0),
        }
    }
}

impl ProgressCallback for TaskProgress {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_position(&self, pos: u64) {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return;
        }
        let percent = pos as f64 / total as f64 * 100.0;
        if let Err(e) = self.handle.set_progress(percent) {
            log::debug!("Dropping progress update: {e}");
        }
    }

    fn set_message(&self, msg: String) {
        if let Err(e) = self.handle.set_progress_with(0.0, Some(msg)) {
            log::debug!("Dropping progress message: {e}");
        }
    }
}
