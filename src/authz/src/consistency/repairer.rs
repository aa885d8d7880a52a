//! Repair execution
//!
//! A repair is a read → plan → write → verify sequence. It runs inside a
//! per-subject slot so two repairs never write the same subject at once.
//! A slot's map entry is dropped once no caller holds or waits on it.
//! A repair whose verification still finds divergence quarantines the
//! subject: further repairs fail with `RepairIneffective` until an operator
//! calls [`Repairer::clear_quarantine`].

use super::checker::ConsistencyChecker;
use super::metrics::MetricsCollector;
use super::planner::RepairPlanner;
use super::types::{
    ConsistencyCheck, ConsistencyIssue, RepairEvent, RepairListener, RepairOutcome, RepairPlan,
};
use crate::error::{AuthzError, Result};
use crate::store::RoleRecordStore;
use crate::types::SubjectId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// What a repair request does when the subject's slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairContention {
    /// Fail immediately with `RepairInProgress`
    #[default]
    Reject,
    /// Wait up to the timeout, then fail with `RepairInProgress`
    Wait(Duration),
}

type SlotMap = DashMap<SubjectId, Arc<Mutex<()>>>;

/// Exclusive hold on one subject's repair slot
struct SlotGuard<'a> {
    slots: &'a SlotMap,
    subject: SubjectId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so the guard's Arc no longer counts
        self.guard.take();
        release_slot(self.slots, &self.subject);
    }
}

/// Drop the subject's slot if only the map still references it
fn release_slot(slots: &SlotMap, subject: &SubjectId) {
    slots.remove_if(subject, |_, slot| Arc::strong_count(slot) == 1);
}

/// Applies repair plans against the role record store
pub struct Repairer {
    store: Arc<dyn RoleRecordStore>,
    checker: ConsistencyChecker,
    planner: RepairPlanner,
    contention: RepairContention,

    /// One mutex per subject with a repair running or waiting
    slots: SlotMap,

    /// Subjects whose last repair was ineffective, with the reason
    quarantine: DashMap<SubjectId, String>,

    listeners: Vec<Arc<dyn RepairListener>>,
    metrics: Arc<MetricsCollector>,
}

impl Repairer {
    pub fn new(store: Arc<dyn RoleRecordStore>, checker: ConsistencyChecker) -> Self {
        let metrics = checker.metrics().clone();
        Self {
            store,
            planner: RepairPlanner::new(checker.clone()),
            checker,
            contention: RepairContention::default(),
            slots: DashMap::new(),
            quarantine: DashMap::new(),
            listeners: Vec::new(),
            metrics,
        }
    }

    pub fn with_contention(mut self, contention: RepairContention) -> Self {
        self.contention = contention;
        self
    }

    /// Register a listener notified after every verified repair
    pub fn with_listener(mut self, listener: Arc<dyn RepairListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn checker(&self) -> &ConsistencyChecker {
        &self.checker
    }

    /// Plan a repair for `subject` without writing anything
    pub async fn preview(&self, subject: &SubjectId) -> Result<RepairPlan> {
        let records = self.store.fetch_records(subject).await?;
        self.planner.plan(subject, &records)
    }

    /// Repair the subject named by `issue`
    ///
    /// The issue only identifies the subject; records are re-read inside the
    /// slot so the plan reflects the current state. Store errors propagate
    /// unchanged and are never retried here.
    pub async fn repair(&self, issue: &ConsistencyIssue) -> Result<RepairOutcome> {
        self.repair_subject(&issue.subject).await
    }

    /// Check and, if needed, repair `subject`
    pub async fn repair_subject(&self, subject: &SubjectId) -> Result<RepairOutcome> {
        let _slot = self.acquire_slot(subject).await?;

        if let Some(reason) = self.quarantine.get(subject) {
            warn!("Refusing repair of quarantined subject {}", subject);
            return Err(AuthzError::RepairIneffective {
                subject: subject.clone(),
                reason: reason.value().clone(),
            });
        }

        let records = self.store.fetch_records(subject).await?;
        if let ConsistencyCheck::Consistent(resolution) = self.checker.classify(subject, &records)? {
            debug!("Subject {} already consistent, nothing to repair", subject);
            self.metrics.record_repair_noop();
            return Ok(RepairOutcome::AlreadyConsistent { resolution });
        }

        let plan = self.planner.plan(subject, &records)?;

        // A failed write may still have landed, so attempts count
        let mut attempted = 0;
        let result = self.apply(subject, plan, &mut attempted).await;
        if result.is_err() && attempted > 0 {
            warn!("Repair of {} failed after {} write attempt(s)", subject, attempted);
            self.invalidate(subject);
        }
        result
    }

    /// Write every action of `plan`, then verify the subject converged
    async fn apply(
        &self,
        subject: &SubjectId,
        plan: RepairPlan,
        attempted: &mut usize,
    ) -> Result<RepairOutcome> {
        for action in &plan.actions {
            info!(
                "Repairing {}: {:?} {} -> {:?}",
                subject, action.kind, action.target, action.roles
            );
            *attempted += 1;
            self.store
                .write_record(subject, action.target, &action.roles)
                .await?;
        }

        let after = self.store.fetch_records(subject).await?;
        let verification = match self.checker.classify(subject, &after) {
            Ok(check) => check,
            Err(AuthzError::NoRoleAssigned(_)) => {
                return Err(self.mark_ineffective(subject, "no roles remain after repair".to_string()));
            }
            Err(e) => return Err(e),
        };

        match verification {
            ConsistencyCheck::Consistent(resolution) => {
                info!(
                    "Repaired {} with {} action(s); primary role {}",
                    subject,
                    plan.actions.len(),
                    resolution.primary
                );
                self.metrics.record_repair_applied();
                self.notify(RepairEvent::new(
                    subject.clone(),
                    plan.actions.clone(),
                    resolution.clone(),
                ));
                Ok(RepairOutcome::Repaired { plan, resolution })
            }
            ConsistencyCheck::Divergent(remaining) => {
                let reason = format!(
                    "{} {:?} still diverges from {} {:?} ({:?})",
                    remaining.source_b,
                    remaining.roles_b,
                    remaining.source_a,
                    remaining.roles_a,
                    remaining.severity
                );
                Err(self.mark_ineffective(subject, reason))
            }
        }
    }

    /// Re-enable repair for a quarantined subject; returns whether it was quarantined
    pub fn clear_quarantine(&self, subject: &SubjectId) -> bool {
        let cleared = self.quarantine.remove(subject).is_some();
        if cleared {
            info!("Quarantine cleared for {}", subject);
        }
        cleared
    }

    /// Quarantined subjects, sorted
    pub fn quarantined(&self) -> Vec<SubjectId> {
        let mut subjects: Vec<SubjectId> = self.quarantine.iter().map(|e| e.key().clone()).collect();
        subjects.sort();
        subjects
    }

    /// Subjects with a repair running or waiting
    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    async fn acquire_slot(&self, subject: &SubjectId) -> Result<SlotGuard<'_>> {
        let slot = self
            .slots
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let guard = match self.contention {
            RepairContention::Reject => slot.clone().try_lock_owned().ok(),
            RepairContention::Wait(timeout) => {
                tokio::time::timeout(timeout, slot.clone().lock_owned()).await.ok()
            }
        };

        match guard {
            Some(guard) => Ok(SlotGuard {
                slots: &self.slots,
                subject: subject.clone(),
                guard: Some(guard),
            }),
            None => {
                // The holder may have finished while we waited
                drop(slot);
                release_slot(&self.slots, subject);

                warn!("Repair already in progress for {}", subject);
                self.metrics.record_contention();
                Err(AuthzError::RepairInProgress(subject.clone()))
            }
        }
    }

    fn mark_ineffective(&self, subject: &SubjectId, reason: String) -> AuthzError {
        error!("Repair ineffective for {}: {}", subject, reason);
        self.metrics.record_repair_ineffective();
        self.quarantine.insert(subject.clone(), reason.clone());
        AuthzError::RepairIneffective {
            subject: subject.clone(),
            reason,
        }
    }

    fn notify(&self, event: RepairEvent) {
        for listener in &self.listeners {
            listener.on_repaired(&event);
        }
    }

    fn invalidate(&self, subject: &SubjectId) {
        for listener in &self.listeners {
            listener.on_invalidated(subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::types::SourceLayout;
    use crate::roles::RoleResolver;
    use crate::store::InMemoryRoleStore;
    use crate::types::{Role, RoleRecord, RoleSource};

    fn repairer(store: Arc<InMemoryRoleStore>) -> Repairer {
        let checker = ConsistencyChecker::new(store.clone(), RoleResolver::new(), SourceLayout::default());
        Repairer::new(store, checker)
    }

    #[tokio::test]
    async fn test_repair_consistent_subject_is_noop() {
        let store = Arc::new(InMemoryRoleStore::from_records(vec![
            RoleRecord::new("user:a", Role::Patient, RoleSource::AssignmentTable),
            RoleRecord::new("user:a", Role::Patient, RoleSource::ProfileField),
        ]));
        let repairer = repairer(store.clone());

        let outcome = repairer.repair_subject(&SubjectId::new("user:a")).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::AlreadyConsistent { .. }));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_preview_does_not_write() {
        let store = Arc::new(InMemoryRoleStore::from_records(vec![RoleRecord::new(
            "user:a",
            Role::Therapist,
            RoleSource::AssignmentTable,
        )]));
        let repairer = repairer(store.clone());

        let plan = repairer.preview(&SubjectId::new("user:a")).await.unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_when_slot_taken() {
        let store = Arc::new(InMemoryRoleStore::new());
        let repairer = repairer(store);
        let subject = SubjectId::new("user:a");

        let _held = repairer.acquire_slot(&subject).await.unwrap();
        let result = repairer.repair_subject(&subject).await;

        assert!(matches!(result, Err(AuthzError::RepairInProgress(_))));
        assert_eq!(repairer.checker().metrics().get_metrics().contention_rejections, 1);
    }

    #[tokio::test]
    async fn test_wait_mode_times_out() {
        let store = Arc::new(InMemoryRoleStore::new());
        let repairer = repairer(store).with_contention(RepairContention::Wait(Duration::from_millis(20)));
        let subject = SubjectId::new("user:a");

        let _held = repairer.acquire_slot(&subject).await.unwrap();
        let result = repairer.repair_subject(&subject).await;

        assert!(matches!(result, Err(AuthzError::RepairInProgress(_))));
    }

    #[tokio::test]
    async fn test_slots_are_per_subject() {
        let store = Arc::new(InMemoryRoleStore::from_records(vec![RoleRecord::new(
            "user:b",
            Role::Patient,
            RoleSource::AssignmentTable,
        )]));
        let repairer = repairer(store);

        let _held = repairer.acquire_slot(&SubjectId::new("user:a")).await.unwrap();
        let outcome = repairer.repair_subject(&SubjectId::new("user:b")).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Repaired { .. }));
    }

    #[tokio::test]
    async fn test_slots_released_after_repairs() {
        let records = (0..1000).flat_map(|i| {
            let subject = format!("user:{}", i);
            [
                RoleRecord::new(subject.as_str(), Role::Patient, RoleSource::AssignmentTable),
                RoleRecord::new(subject.as_str(), Role::Patient, RoleSource::ProfileField),
            ]
        });
        let store = Arc::new(InMemoryRoleStore::from_records(records));
        store
            .insert(RoleRecord::new("user:divergent", Role::Admin, RoleSource::AssignmentTable))
            .await;
        let repairer = repairer(store.clone());

        for subject in store.subjects().await {
            repairer.repair_subject(&subject).await.unwrap();
        }
        // Failing repairs release their slot too
        assert!(repairer.repair_subject(&SubjectId::new("user:ghost")).await.is_err());

        assert_eq!(repairer.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_slot_kept_while_held() {
        let store = Arc::new(InMemoryRoleStore::new());
        let repairer = repairer(store);
        let subject = SubjectId::new("user:a");

        let held = repairer.acquire_slot(&subject).await.unwrap();
        assert!(repairer.repair_subject(&subject).await.is_err());
        assert_eq!(repairer.active_slots(), 1);

        drop(held);
        assert_eq!(repairer.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_waiter_releases_slot() {
        let store = Arc::new(InMemoryRoleStore::new());
        let repairer = repairer(store).with_contention(RepairContention::Wait(Duration::from_millis(20)));
        let subject = SubjectId::new("user:a");

        let held = repairer.acquire_slot(&subject).await.unwrap();
        let waiter = repairer.repair_subject(&subject).await;
        assert!(matches!(waiter, Err(AuthzError::RepairInProgress(_))));

        drop(held);
        assert_eq!(repairer.active_slots(), 0);
    }
}
