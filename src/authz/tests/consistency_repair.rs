//! Consistency check and repair integration tests
//!
//! Store → checker → planner → repairer → listener, against the in-memory
//! store and a few misbehaving store wrappers.

use async_trait::async_trait;
use futures::future::join;
use haven_authz::{
    consistency::RepairKind,
    error::{AuthzError, Result},
    types::{Role, RoleRecord, RoleSource, SubjectId},
    AuthStatus, ConsistencyCheck, EngineConfig, InMemoryRoleStore, RepairContention, RepairEvent,
    RepairListener, RepairOutcome, RoleRecordStore, Severity, StatusCache,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn subject() -> SubjectId {
    SubjectId::new("user:alice")
}

fn roles_in(records: &[RoleRecord], source: RoleSource) -> BTreeSet<Role> {
    records
        .iter()
        .filter(|r| r.source == source)
        .map(|r| r.role)
        .collect()
}

/// Delays every write so concurrent repairs overlap
struct SlowStore {
    inner: InMemoryRoleStore,
    delay: Duration,
}

#[async_trait]
impl RoleRecordStore for SlowStore {
    async fn fetch_records(&self, subject: &SubjectId) -> Result<Vec<RoleRecord>> {
        self.inner.fetch_records(subject).await
    }

    async fn write_record(&self, subject: &SubjectId, source: RoleSource, roles: &[Role]) -> Result<()> {
        sleep(self.delay).await;
        self.inner.write_record(subject, source, roles).await
    }
}

/// Acknowledges writes to the profile field without applying them
struct StaleProfileStore {
    inner: InMemoryRoleStore,
}

#[async_trait]
impl RoleRecordStore for StaleProfileStore {
    async fn fetch_records(&self, subject: &SubjectId) -> Result<Vec<RoleRecord>> {
        self.inner.fetch_records(subject).await
    }

    async fn write_record(&self, subject: &SubjectId, source: RoleSource, roles: &[Role]) -> Result<()> {
        if source == RoleSource::ProfileField {
            return Ok(());
        }
        self.inner.write_record(subject, source, roles).await
    }
}

/// Rejects every write
struct ReadOnlyStore {
    inner: InMemoryRoleStore,
}

#[async_trait]
impl RoleRecordStore for ReadOnlyStore {
    async fn fetch_records(&self, subject: &SubjectId) -> Result<Vec<RoleRecord>> {
        self.inner.fetch_records(subject).await
    }

    async fn write_record(&self, _subject: &SubjectId, _source: RoleSource, _roles: &[Role]) -> Result<()> {
        Err(AuthzError::Store("connection reset".to_string()))
    }
}

/// Applies writes but reports them as failed, like a lost acknowledgement
struct LostAckStore {
    inner: InMemoryRoleStore,
}

#[async_trait]
impl RoleRecordStore for LostAckStore {
    async fn fetch_records(&self, subject: &SubjectId) -> Result<Vec<RoleRecord>> {
        self.inner.fetch_records(subject).await
    }

    async fn write_record(&self, subject: &SubjectId, source: RoleSource, roles: &[Role]) -> Result<()> {
        self.inner.write_record(subject, source, roles).await?;
        Err(AuthzError::Store("acknowledgement lost".to_string()))
    }
}

#[derive(Default)]
struct CountingListener {
    events: AtomicUsize,
    invalidations: AtomicUsize,
}

impl RepairListener for CountingListener {
    fn on_repaired(&self, _event: &RepairEvent) {
        self.events.fetch_add(1, Ordering::SeqCst);
    }

    fn on_invalidated(&self, _subject: &SubjectId) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// DETECTION
// ============================================================================

#[tokio::test]
async fn test_missing_profile_role_detected() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Therapist,
        RoleSource::AssignmentTable,
    )]));
    let engine = EngineConfig::default().build(store).unwrap();

    let check = engine.checker.check_consistency(&subject()).await.unwrap();
    let issue = check.issue().expect("divergence expected");

    assert_eq!(issue.severity, Severity::MissingRole);
    assert_eq!(issue.source_a, RoleSource::AssignmentTable);
    assert_eq!(issue.source_b, RoleSource::ProfileField);
    assert_eq!(issue.roles_a, vec![Role::Therapist]);
    assert!(issue.roles_b.is_empty());
}

#[tokio::test]
async fn test_conflicting_primary_detected() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Admin, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
    ]));
    let engine = EngineConfig::default().build(store).unwrap();

    let check = engine.checker.check_consistency(&subject()).await.unwrap();
    assert_eq!(check.issue().map(|i| i.severity), Some(Severity::ConflictingPrimary));

    let metrics = engine.checker.metrics().get_metrics();
    assert_eq!(metrics.checks, 1);
    assert_eq!(metrics.conflicting_primary, 1);
}

#[tokio::test]
async fn test_extra_role_with_same_primary_is_missing_role() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Admin, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Therapist, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Admin, RoleSource::ProfileField),
    ]));
    let engine = EngineConfig::default().build(store).unwrap();

    let check = engine.checker.check_consistency(&subject()).await.unwrap();
    assert_eq!(check.issue().map(|i| i.severity), Some(Severity::MissingRole));
}

#[tokio::test]
async fn test_subject_without_roles_is_an_error() {
    let store = Arc::new(InMemoryRoleStore::new());
    let engine = EngineConfig::default().build(store).unwrap();

    let result = engine.checker.check_consistency(&subject()).await;
    assert!(matches!(result, Err(AuthzError::NoRoleAssigned(_))));
}

// ============================================================================
// REPAIR
// ============================================================================

#[tokio::test]
async fn test_missing_role_repair_promotes_profile() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Therapist,
        RoleSource::AssignmentTable,
    )]));
    let engine = EngineConfig::default().build(store.clone()).unwrap();

    let check = engine.checker.check_consistency(&subject()).await.unwrap();
    let issue = check.issue().unwrap().clone();

    let outcome = engine.repairer.repair(&issue).await.unwrap();
    let RepairOutcome::Repaired { plan, resolution } = outcome else {
        panic!("expected a repair");
    };

    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].target, RoleSource::ProfileField);
    assert_eq!(plan.actions[0].kind, RepairKind::Promote);
    assert_eq!(plan.actions[0].roles, vec![Role::Therapist]);
    assert_eq!(resolution.primary, Role::Therapist);

    let records = store.fetch_records(&subject()).await.unwrap();
    let expected: BTreeSet<Role> = [Role::Therapist].into_iter().collect();
    assert_eq!(roles_in(&records, RoleSource::AssignmentTable), expected);
    assert_eq!(roles_in(&records, RoleSource::ProfileField), expected);

    let recheck = engine.checker.check_consistency(&subject()).await.unwrap();
    assert!(recheck.is_consistent());
}

#[tokio::test]
async fn test_missing_role_repair_never_removes_roles() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Therapist, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
        RoleRecord::new("user:alice", Role::Therapist, RoleSource::ProfileField),
    ]));
    let engine = EngineConfig::default().build(store.clone()).unwrap();

    let outcome = engine.repairer.repair_subject(&subject()).await.unwrap();
    assert!(matches!(outcome, RepairOutcome::Repaired { .. }));

    let records = store.fetch_records(&subject()).await.unwrap();
    let union: BTreeSet<Role> = [Role::Patient, Role::Therapist].into_iter().collect();
    assert_eq!(roles_in(&records, RoleSource::AssignmentTable), union);
    assert_eq!(roles_in(&records, RoleSource::ProfileField), union);
}

#[tokio::test]
async fn test_conflict_repair_follows_authoritative_source() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Admin, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
    ]));
    let engine = EngineConfig::default().build(store.clone()).unwrap();

    let outcome = engine.repairer.repair_subject(&subject()).await.unwrap();
    let RepairOutcome::Repaired { plan, resolution } = outcome else {
        panic!("expected a repair");
    };

    assert_eq!(plan.authoritative, Some(RoleSource::AssignmentTable));
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].kind, RepairKind::Synchronize);
    assert_eq!(resolution.primary, Role::Admin);

    let records = store.fetch_records(&subject()).await.unwrap();
    let admin: BTreeSet<Role> = [Role::Admin].into_iter().collect();
    assert_eq!(roles_in(&records, RoleSource::ProfileField), admin);
}

#[tokio::test]
async fn test_authoritative_source_is_configurable() {
    let toml = r#"
[consistency]
sources = ["assignment_table", "profile_field"]
authoritative = "profile_field"
"#;
    let store = Arc::new(InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Admin, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
    ]));
    let engine = EngineConfig::from_toml_str(toml).unwrap().build(store.clone()).unwrap();

    let outcome = engine.repairer.repair_subject(&subject()).await.unwrap();
    assert_eq!(outcome.resolution().primary, Role::Patient);

    let records = store.fetch_records(&subject()).await.unwrap();
    let patient: BTreeSet<Role> = [Role::Patient].into_iter().collect();
    assert_eq!(roles_in(&records, RoleSource::AssignmentTable), patient);
}

#[tokio::test]
async fn test_repair_is_idempotent() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Patient,
        RoleSource::ProfileField,
    )]));
    let engine = EngineConfig::default().build(store.clone()).unwrap();

    let first = engine.repairer.repair_subject(&subject()).await.unwrap();
    assert!(matches!(first, RepairOutcome::Repaired { .. }));
    let writes = store.write_count();

    let second = engine.repairer.repair_subject(&subject()).await.unwrap();
    assert!(matches!(second, RepairOutcome::AlreadyConsistent { .. }));
    assert_eq!(store.write_count(), writes);
    assert_eq!(first.resolution(), second.resolution());

    let metrics = engine.checker.metrics().get_metrics();
    assert_eq!(metrics.repairs_applied, 1);
    assert_eq!(metrics.repairs_noop, 1);
}

#[tokio::test]
async fn test_repair_uses_current_state_not_stale_issue() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Therapist,
        RoleSource::AssignmentTable,
    )]));
    let engine = EngineConfig::default().build(store.clone()).unwrap();

    let check = engine.checker.check_consistency(&subject()).await.unwrap();
    let issue = check.issue().unwrap().clone();

    // Replication catches up before the repair runs
    store
        .write_record(&subject(), RoleSource::ProfileField, &[Role::Therapist])
        .await
        .unwrap();
    let writes = store.write_count();

    let outcome = engine.repairer.repair(&issue).await.unwrap();
    assert!(matches!(outcome, RepairOutcome::AlreadyConsistent { .. }));
    assert_eq!(store.write_count(), writes);
}

// ============================================================================
// FAILURE MODES
// ============================================================================

#[tokio::test]
async fn test_ineffective_repair_quarantines_subject() {
    let inner = InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Therapist,
        RoleSource::AssignmentTable,
    )]);
    let store = Arc::new(StaleProfileStore { inner });
    let listener = Arc::new(CountingListener::default());
    let engine = EngineConfig::default()
        .build(store)
        .unwrap()
        .with_listener(listener.clone());

    let result = engine.repairer.repair_subject(&subject()).await;
    assert!(matches!(result, Err(AuthzError::RepairIneffective { .. })));
    assert_eq!(engine.repairer.quarantined(), vec![subject()]);
    assert_eq!(listener.events.load(Ordering::SeqCst), 0);

    // Stays quarantined without touching the store again
    let again = engine.repairer.repair_subject(&subject()).await;
    assert!(matches!(again, Err(AuthzError::RepairIneffective { .. })));

    // Only the first attempt wrote anything
    assert_eq!(listener.invalidations.load(Ordering::SeqCst), 1);

    assert!(engine.repairer.clear_quarantine(&subject()));
    assert!(!engine.repairer.clear_quarantine(&subject()));
    assert!(engine.repairer.quarantined().is_empty());

    let metrics = engine.checker.metrics().get_metrics();
    assert_eq!(metrics.repairs_ineffective, 1);
}

#[tokio::test]
async fn test_store_errors_propagate_without_quarantine() {
    let inner = InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Admin,
        RoleSource::AssignmentTable,
    )]);
    let listener = Arc::new(CountingListener::default());
    let engine = EngineConfig::default()
        .build(Arc::new(ReadOnlyStore { inner }))
        .unwrap()
        .with_listener(listener.clone());

    let result = engine.repairer.repair_subject(&subject()).await;
    match result {
        Err(e @ AuthzError::Store(_)) => assert!(e.is_retryable()),
        other => panic!("expected store error, got {:?}", other),
    }
    assert!(engine.repairer.quarantined().is_empty());

    // The rejected write may still have landed, so cached views are dropped
    assert_eq!(listener.invalidations.load(Ordering::SeqCst), 1);
    assert_eq!(listener.events.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_repair_after_write_invalidates_cache() {
    let toml = r#"
[consistency]
sources = ["assignment_table", "profile_field"]
authoritative = "profile_field"
"#;
    let inner = InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Admin, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
    ]);
    let store = Arc::new(LostAckStore { inner });
    let cache = Arc::new(StatusCache::new());
    let listener = Arc::new(CountingListener::default());
    let engine = EngineConfig::from_toml_str(toml)
        .unwrap()
        .build(store.clone())
        .unwrap()
        .with_listener(cache.clone())
        .with_listener(listener.clone());

    let before = cache
        .refresh(&subject(), store.as_ref(), &engine.resolver)
        .await
        .unwrap();
    assert_eq!(before.resolution().map(|r| r.primary), Some(Role::Admin));

    let result = engine.repairer.repair_subject(&subject()).await;
    assert!(matches!(result, Err(AuthzError::Store(_))));

    // The demotion landed; the stale admin status must not survive
    assert_eq!(cache.status(&subject()), AuthStatus::Loading);
    assert_eq!(listener.invalidations.load(Ordering::SeqCst), 1);
    assert_eq!(listener.events.load(Ordering::SeqCst), 0);

    let after = cache
        .refresh(&subject(), store.as_ref(), &engine.resolver)
        .await
        .unwrap();
    assert_eq!(after.resolution().map(|r| r.primary), Some(Role::Patient));
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_concurrent_repairs_reject_second_caller() {
    let inner = InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Therapist,
        RoleSource::AssignmentTable,
    )]);
    let store = Arc::new(SlowStore {
        inner,
        delay: Duration::from_millis(50),
    });
    let engine = EngineConfig::default().build(store.clone()).unwrap();
    let subject = subject();

    let (first, second) = join(
        engine.repairer.repair_subject(&subject),
        engine.repairer.repair_subject(&subject),
    )
    .await;

    assert!(matches!(first, Ok(RepairOutcome::Repaired { .. })));
    assert!(matches!(second, Err(AuthzError::RepairInProgress(_))));
    assert_eq!(store.inner.write_count(), 1);
}

#[tokio::test]
async fn test_concurrent_repairs_wait_mode_serializes() {
    let inner = InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Admin, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
    ]);
    let store = Arc::new(SlowStore {
        inner,
        delay: Duration::from_millis(20),
    });
    let mut engine = EngineConfig::default().build(store.clone()).unwrap();
    engine.repairer = engine
        .repairer
        .with_contention(RepairContention::Wait(Duration::from_secs(2)));
    let subject = subject();

    let (first, second) = join(
        engine.repairer.repair_subject(&subject),
        engine.repairer.repair_subject(&subject),
    )
    .await;

    assert!(matches!(first, Ok(RepairOutcome::Repaired { .. })));
    assert!(matches!(second, Ok(RepairOutcome::AlreadyConsistent { .. })));
    assert_eq!(store.inner.write_count(), 1);
    assert_eq!(first.unwrap().resolution(), second.unwrap().resolution());
}

// ============================================================================
// NOTIFICATION
// ============================================================================

#[tokio::test]
async fn test_repair_invalidates_status_cache() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![
        RoleRecord::new("user:alice", Role::Admin, RoleSource::AssignmentTable),
        RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
    ]));
    let cache = Arc::new(StatusCache::new());
    let listener = Arc::new(CountingListener::default());
    let engine = EngineConfig::default()
        .build(store.clone())
        .unwrap()
        .with_listener(cache.clone())
        .with_listener(listener.clone());

    let before = cache
        .refresh(&subject(), store.as_ref(), &engine.resolver)
        .await
        .unwrap();
    assert!(matches!(before, AuthStatus::Authorized(_)));

    engine.repairer.repair_subject(&subject()).await.unwrap();
    assert_eq!(cache.status(&subject()), AuthStatus::Loading);
    assert_eq!(listener.events.load(Ordering::SeqCst), 1);

    let after = cache
        .refresh(&subject(), store.as_ref(), &engine.resolver)
        .await
        .unwrap();
    let resolution = after.resolution().unwrap();
    assert_eq!(resolution.primary, Role::Admin);
    assert!(!resolution.roles.contains(Role::Patient));

    // No-op repairs do not notify
    engine.repairer.repair_subject(&subject()).await.unwrap();
    assert_eq!(listener.events.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_consistency_check_serializes() {
    let store = Arc::new(InMemoryRoleStore::from_records(vec![RoleRecord::new(
        "user:alice",
        Role::Therapist,
        RoleSource::AssignmentTable,
    )]));
    let engine = EngineConfig::default().build(store).unwrap();

    let check = engine.checker.check_consistency(&subject()).await.unwrap();
    let json = serde_json::to_value(&check).unwrap();

    assert_eq!(json["status"], "divergent");
    assert_eq!(json["severity"], "missing-role");
    assert!(matches!(check, ConsistencyCheck::Divergent(_)));
}
