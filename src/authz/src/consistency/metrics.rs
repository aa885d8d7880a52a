//! Counters for consistency checks and repairs

use super::types::Severity;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyMetrics {
    /// Total consistency checks run
    pub checks: u64,

    /// Checks that found every source in agreement
    pub consistent: u64,

    /// Divergences by severity
    pub missing_role: u64,
    pub conflicting_primary: u64,

    /// Repairs that wrote and verified
    pub repairs_applied: u64,

    /// Repairs that found nothing to do
    pub repairs_noop: u64,

    /// Repairs whose verification still found divergence
    pub repairs_ineffective: u64,

    /// Repairs rejected because another held the subject's slot
    pub contention_rejections: u64,
}

impl ConsistencyMetrics {
    /// Fraction of checks that found divergence
    pub fn divergence_rate(&self) -> f64 {
        if self.checks == 0 {
            0.0
        } else {
            (self.missing_role + self.conflicting_primary) as f64 / self.checks as f64
        }
    }
}

/// Lock-free metrics collector shared by the checker and repairer
#[derive(Debug, Default)]
pub struct MetricsCollector {
    checks: AtomicU64,
    consistent: AtomicU64,
    missing_role: AtomicU64,
    conflicting_primary: AtomicU64,
    repairs_applied: AtomicU64,
    repairs_noop: AtomicU64,
    repairs_ineffective: AtomicU64,
    contention_rejections: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a check result; `None` means consistent
    pub fn record_check(&self, severity: Option<Severity>) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let counter = match severity {
            None => &self.consistent,
            Some(Severity::MissingRole) => &self.missing_role,
            Some(Severity::ConflictingPrimary) => &self.conflicting_primary,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repair_applied(&self) {
        self.repairs_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repair_noop(&self) {
        self.repairs_noop.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repair_ineffective(&self) {
        self.repairs_ineffective.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contention(&self) {
        self.contention_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters
    pub fn get_metrics(&self) -> ConsistencyMetrics {
        ConsistencyMetrics {
            checks: self.checks.load(Ordering::Relaxed),
            consistent: self.consistent.load(Ordering::Relaxed),
            missing_role: self.missing_role.load(Ordering::Relaxed),
            conflicting_primary: self.conflicting_primary.load(Ordering::Relaxed),
            repairs_applied: self.repairs_applied.load(Ordering::Relaxed),
            repairs_noop: self.repairs_noop.load(Ordering::Relaxed),
            repairs_ineffective: self.repairs_ineffective.load(Ordering::Relaxed),
            contention_rejections: self.contention_rejections.load(Ordering::Relaxed),
        }
    }
}
