//! Progress reporting for the provision computation.
//!
//! Decouples the engine from whoever observes it (a task record, a log
//! line, or nothing at all).

/// Receives progress updates from a long-running computation.
///
/// Implementations must be `Send + Sync` so a callback can be handed to a
/// blocking worker thread.
pub trait ProgressCallback: Send + Sync {
    /// Set the total expected units of work.
    fn set_total(&self, total: u64);

    /// Set the current position (absolute, not delta).
    fn set_position(&self, pos: u64);

    /// Update the message describing the current step.
    fn set_message(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn set_position(&self, _pos: u64) {}
    fn set_message(&self, _msg: String) {}
}
