//! Scheduler lifecycle state.

/// Scheduler operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created, refresh loop not yet started.
    Starting,
    /// Refresh loop is running.
    Running,
    /// Stop requested; the current pass is finishing.
    ShuttingDown,
    /// Refresh loop has exited.
    Stopped,
}

impl SchedulerState {
    pub fn is_running(&self) -> bool {
        matches!(self, SchedulerState::Running)
    }

    /// Check if the scheduler is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerState::Stopped)
    }
}
