//! State carried by a session while a transport upgrade is in progress.
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::transport::Transport;

/// Progress of an upgrade. `Complete` is transient: once the probe has
/// replaced the origin the state returns to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradeStatus {
    None,
    Initiated,
    Probed,
    Complete,
}

/// While `Initiated` or `Probed`, the session's current transport is the
/// origin and `probe` holds the candidate replacement; both are live and
/// the session arbitrates which may carry which packet.
pub(crate) struct UpgradeState {
    pub status: UpgradeStatus,
    pub probe: Option<Transport>,
    pub started_at: Option<Instant>,
    pub timeout_task: Option<JoinHandle<()>>,
}

impl UpgradeState {
    pub(crate) fn new() -> Self {
        Self {
            status: UpgradeStatus::None,
            probe: None,
            started_at: None,
            timeout_task: None,
        }
    }

    pub(crate) fn in_progress(&self) -> bool {
        matches!(self.status, UpgradeStatus::Initiated | UpgradeStatus::Probed)
    }

    /// Returns to `None`, yielding the probe and the timeout task for the
    /// caller to dispose outside the session lock.
    pub(crate) fn reset(&mut self) -> (Option<Transport>, Option<JoinHandle<()>>) {
        self.status = UpgradeStatus::None;
        self.started_at = None;
        (self.probe.take(), self.timeout_task.take())
    }
}
