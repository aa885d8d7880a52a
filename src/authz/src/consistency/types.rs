//! Consistency and repair types

use crate::error::{AuthzError, Result};
use crate::roles::Resolution;
use crate::types::{Role, RoleRecord, RoleSource, SubjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;
use uuid::Uuid;

/// How serious a divergence between two sources is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// One source lacks roles the other has; usually replication lag
    MissingRole,
    /// The sources imply different primary roles
    ConflictingPrimary,
}

/// Divergence between two role sources for one subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub subject: SubjectId,
    pub source_a: RoleSource,
    pub source_b: RoleSource,
    pub roles_a: Vec<Role>,
    pub roles_b: Vec<Role>,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

/// Result of a consistency check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsistencyCheck {
    /// Every source holds the same role set
    Consistent(Resolution),
    /// At least one source disagrees; carries the most severe divergence
    Divergent(ConsistencyIssue),
}

impl ConsistencyCheck {
    pub fn is_consistent(&self) -> bool {
        matches!(self, ConsistencyCheck::Consistent(_))
    }

    pub fn issue(&self) -> Option<&ConsistencyIssue> {
        match self {
            ConsistencyCheck::Divergent(issue) => Some(issue),
            ConsistencyCheck::Consistent(_) => None,
        }
    }
}

/// Kind of write a repair action performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// Only adds roles to the target
    Promote,
    /// Only removes roles from the target
    Demote,
    /// Adds and removes roles
    Synchronize,
}

impl RepairKind {
    /// Classify the write that turns `current` into `target`
    pub fn between(current: &BTreeSet<Role>, target: &BTreeSet<Role>) -> Self {
        if current.is_subset(target) {
            RepairKind::Promote
        } else if target.is_subset(current) {
            RepairKind::Demote
        } else {
            RepairKind::Synchronize
        }
    }
}

/// One write that aligns a source with the resolved decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAction {
    pub subject: SubjectId,
    /// Source to overwrite
    pub target: RoleSource,
    pub kind: RepairKind,
    /// Complete role list the target holds after the write
    pub roles: Vec<Role>,
}

/// Proposed repair for one subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub subject: SubjectId,

    /// Resolution every source agrees on once the plan is applied
    pub resolution: Resolution,

    /// Source that won a primary-role conflict, if one was forced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authoritative: Option<RoleSource>,

    pub actions: Vec<RepairAction>,
}

impl RepairPlan {
    /// True when the plan writes nothing
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Successful result of a repair request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// Sources already agreed; nothing was written
    AlreadyConsistent { resolution: Resolution },
    /// The plan was applied and verified
    Repaired {
        plan: RepairPlan,
        resolution: Resolution,
    },
}

impl RepairOutcome {
    pub fn resolution(&self) -> &Resolution {
        match self {
            RepairOutcome::AlreadyConsistent { resolution } => resolution,
            RepairOutcome::Repaired { resolution, .. } => resolution,
        }
    }
}

/// Notification emitted after a verified repair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairEvent {
    pub id: Uuid,
    pub subject: SubjectId,
    pub actions: Vec<RepairAction>,
    pub resolution: Resolution,
    pub repaired_at: DateTime<Utc>,
}

impl RepairEvent {
    pub fn new(subject: SubjectId, actions: Vec<RepairAction>, resolution: Resolution) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            actions,
            resolution,
            repaired_at: Utc::now(),
        }
    }
}

/// Receives repair notifications, e.g. to invalidate cached role sets
pub trait RepairListener: Send + Sync {
    fn on_repaired(&self, event: &RepairEvent);

    /// A failed repair already wrote to at least one source for `subject`
    fn on_invalidated(&self, _subject: &SubjectId) {}
}

/// The sources a subject's roles live in, and which one wins conflicts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    sources: Vec<RoleSource>,
    authoritative: RoleSource,
}

impl SourceLayout {
    /// `authoritative` must be one of `sources`; sources must be distinct
    pub fn new(sources: Vec<RoleSource>, authoritative: RoleSource) -> Result<Self> {
        if sources.is_empty() {
            return Err(AuthzError::InvalidConfig(
                "At least one role source must be configured".to_string(),
            ));
        }

        let distinct: BTreeSet<RoleSource> = sources.iter().copied().collect();
        if distinct.len() != sources.len() {
            return Err(AuthzError::InvalidConfig(
                "Role sources must not repeat".to_string(),
            ));
        }

        if !distinct.contains(&authoritative) {
            return Err(AuthzError::InvalidConfig(format!(
                "Authoritative source '{}' is not a configured source",
                authoritative
            )));
        }

        Ok(Self {
            sources,
            authoritative,
        })
    }

    pub fn sources(&self) -> &[RoleSource] {
        &self.sources
    }

    pub fn authoritative(&self) -> RoleSource {
        self.authoritative
    }

    /// Group a subject's records per configured source, in configured order
    ///
    /// A source without records yields an empty snapshot.
    pub fn snapshots(&self, subject: &SubjectId, records: &[RoleRecord]) -> Vec<SourceSnapshot> {
        let mut snapshots: Vec<SourceSnapshot> = self
            .sources
            .iter()
            .map(|source| SourceSnapshot {
                source: *source,
                roles: BTreeSet::new(),
            })
            .collect();

        for record in records.iter().filter(|r| &r.subject == subject) {
            match snapshots.iter_mut().find(|s| s.source == record.source) {
                Some(snapshot) => {
                    snapshot.roles.insert(record.role);
                }
                None => warn!(
                    "Ignoring record from unconfigured source {} for subject {}",
                    record.source, subject
                ),
            }
        }

        snapshots
    }
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            sources: vec![RoleSource::AssignmentTable, RoleSource::ProfileField],
            authoritative: RoleSource::AssignmentTable,
        }
    }
}

/// Roles one source currently asserts for a subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub source: RoleSource,
    pub roles: BTreeSet<Role>,
}
