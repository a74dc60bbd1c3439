use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use super::classify::FailureKind;
use super::error::UpdateError;

/// Where a coordinator is in its refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Refreshing,
    Succeeded,
    Failed(FailureKind),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Refreshing => write!(f, "refreshing"),
            Phase::Succeeded => write!(f, "succeeded"),
            Phase::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// Snapshot of a coordinator's state.
///
/// The coordinator swaps in a new snapshot on every change. Listeners and
/// readers only ever see complete, immutable snapshots.
pub struct CoordinatorState<T> {
    /// Last successfully fetched payload. Never cleared by a failure.
    pub data: Option<Arc<T>>,

    /// Whether the most recent refresh succeeded.
    pub last_update_success: bool,

    /// Error from the most recent failed refresh, cleared on the next success.
    pub last_exception: Option<UpdateError>,

    /// When the most recent successful refresh completed.
    pub last_update_success_time: Option<SystemTime>,

    /// Polling cadence. `None` means periodic polling is suspended.
    pub update_interval: Option<Duration>,

    /// True while a fetch is outstanding.
    pub in_progress: bool,

    /// Set when the most recent failure was an authentication failure.
    pub auth_failed: bool,

    pub phase: Phase,
}

impl<T> CoordinatorState<T> {
    pub(crate) fn new(update_interval: Option<Duration>) -> Self {
        Self {
            data: None,
            last_update_success: false,
            last_exception: None,
            last_update_success_time: None,
            update_interval,
            in_progress: false,
            auth_failed: false,
            phase: Phase::Idle,
        }
    }
}

// Manual impl: cloning a snapshot must not require `T: Clone`.
impl<T> Clone for CoordinatorState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            last_update_success: self.last_update_success,
            last_exception: self.last_exception.clone(),
            last_update_success_time: self.last_update_success_time,
            update_interval: self.update_interval,
            in_progress: self.in_progress,
            auth_failed: self.auth_failed,
            phase: self.phase,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CoordinatorState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorState")
            .field("data", &self.data)
            .field("last_update_success", &self.last_update_success)
            .field("last_exception", &self.last_exception)
            .field("last_update_success_time", &self.last_update_success_time)
            .field("update_interval", &self.update_interval)
            .field("in_progress", &self.in_progress)
            .field("auth_failed", &self.auth_failed)
            .field("phase", &self.phase)
            .finish()
    }
}
