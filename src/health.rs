//! Process-wide health signals reported by the persistence path.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Tracks whether the journal is accepting writes.
///
/// Every successful batch marks the journal healthy again; every failed
/// batch marks it failed and bumps the failure counter. Cheap to clone;
/// all clones share state.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    journal_ok: Arc<AtomicBool>,
    journal_failures: Arc<AtomicU64>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self {
            journal_ok: Arc::new(AtomicBool::new(true)),
            journal_failures: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal_ok(&self) {
        if !self.journal_ok.swap(true, Ordering::SeqCst) {
            tracing::info!("journal is healthy again");
        }
    }

    pub fn journal_failed(&self, cause: &dyn Display) {
        self.journal_ok.store(false, Ordering::SeqCst);
        let total = self.journal_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::error!(error = %cause, failures = total, "journal write failed");
    }

    pub fn is_journal_healthy(&self) -> bool {
        self.journal_ok.load(Ordering::SeqCst)
    }

    pub fn journal_failures(&self) -> u64 {
        self.journal_failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let health = HealthMonitor::new();
        assert!(health.is_journal_healthy());
        assert_eq!(health.journal_failures(), 0);
    }

    #[test]
    fn failure_then_recovery() {
        let health = HealthMonitor::new();
        let shared = health.clone();
        shared.journal_failed(&"disk full");
        assert!(!health.is_journal_healthy());
        assert_eq!(health.journal_failures(), 1);

        shared.journal_ok();
        assert!(health.is_journal_healthy());
        assert_eq!(health.journal_failures(), 1, "counter is cumulative");
    }
}
