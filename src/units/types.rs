// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the units orchestrator.

use std::time::Duration;

use tokio::sync::watch;

/// Orchestrator lifecycle state.
///
/// Use [`super::RunningStorageUnits::state()`] to check the current state or
/// [`super::RunningStorageUnits::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitsState {
    /// Buffer and units built, resync tasks not started
    Initialized,
    /// Resync tasks running
    Running,
    /// Shutdown signalled, waiting for in-flight passes
    ShuttingDown,
    /// Every resync task has exited
    Stopped,
}

impl std::fmt::Display for UnitsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Outcome of one resync pass over one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub unit: String,
    /// Unsynced items returned by discovery (bounded by the batch limit)
    pub discovered: usize,
    /// Items now recorded on the unit, `already_recorded` included
    pub synced: usize,
    /// Items a concurrent pass had recorded first
    pub already_recorded: usize,
    /// Items skipped after an error; retried next tick
    pub failed: usize,
    /// The pass stopped early because shutdown was signalled
    pub cancelled: bool,
    /// The pass stopped early on rejected credentials
    pub fatal: bool,
    pub duration: Duration,
}

impl ResyncReport {
    pub(crate) fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            ..Default::default()
        }
    }

    /// Every discovered item was synced.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled && !self.fatal
    }
}

/// Cooperative cancellation signal shared by every resync task.
///
/// Triggered by sending `true` on the paired sender, or by dropping it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown is signalled.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", UnitsState::Initialized), "Initialized");
        assert_eq!(format!("{}", UnitsState::Running), "Running");
        assert_eq!(format!("{}", UnitsState::Stopped), "Stopped");
    }

    #[test]
    fn test_report_is_success() {
        let mut report = ResyncReport::new("local");
        report.discovered = 3;
        report.synced = 3;
        assert!(report.is_success());

        report.failed = 1;
        assert!(!report.is_success());

        let cancelled = ResyncReport { cancelled: true, ..ResyncReport::new("local") };
        assert!(!cancelled.is_success());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown::new(rx);
        assert!(!shutdown.is_triggered());

        tx.send(true).unwrap();
        assert!(shutdown.is_triggered());
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown::new(rx);
        drop(tx);
        assert!(shutdown.is_triggered());
        shutdown.wait().await;
    }
}
