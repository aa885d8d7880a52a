//! Repair planning
//!
//! Turns a subject's divergent records into a [`RepairPlan`] without
//! touching storage, so a plan can be previewed before it is applied.
//!
//! Two strategies:
//!
//! - Missing roles only: every source is promoted to the union of all
//!   sources. No asserted role is ever removed.
//! - Primary-role conflict: the authoritative source's role set wins and
//!   every other source is overwritten with it. When the authoritative
//!   source is empty, the union is used instead.

use super::checker::ConsistencyChecker;
use super::types::{RepairAction, RepairKind, RepairPlan, Severity};
use crate::error::{AuthzError, Result};
use crate::types::{Role, RoleRecord, SubjectId};
use std::collections::BTreeSet;
use tracing::debug;

/// Computes repair plans
#[derive(Clone)]
pub struct RepairPlanner {
    checker: ConsistencyChecker,
}

impl RepairPlanner {
    pub fn new(checker: ConsistencyChecker) -> Self {
        Self { checker }
    }

    /// Plan the writes that bring every source into agreement
    pub fn plan(&self, subject: &SubjectId, records: &[RoleRecord]) -> Result<RepairPlan> {
        let layout = self.checker.layout();
        let snapshots = layout.snapshots(subject, records);

        let union: BTreeSet<Role> = snapshots.iter().flat_map(|s| s.roles.iter().copied()).collect();
        if union.is_empty() {
            return Err(AuthzError::NoRoleAssigned(subject.clone()));
        }

        let authoritative = snapshots
            .iter()
            .find(|s| s.source == layout.authoritative())
            .ok_or_else(|| {
                AuthzError::InvalidConfig("Authoritative source has no snapshot".to_string())
            })?;

        let mut conflict = false;
        for other in snapshots.iter().filter(|s| s.source != authoritative.source) {
            if other.roles != authoritative.roles
                && self.checker.severity(authoritative, other)? == Severity::ConflictingPrimary
            {
                conflict = true;
                break;
            }
        }

        let (target, winner) = if conflict && !authoritative.roles.is_empty() {
            (authoritative.roles.clone(), Some(authoritative.source))
        } else {
            (union, None)
        };

        let actions: Vec<RepairAction> = snapshots
            .iter()
            .filter(|s| s.roles != target)
            .map(|s| RepairAction {
                subject: subject.clone(),
                target: s.source,
                kind: RepairKind::between(&s.roles, &target),
                roles: target.iter().copied().collect(),
            })
            .collect();

        let resolution = self
            .checker
            .resolver()
            .resolve_roles(subject, target.iter().copied())?;

        debug!(
            "Planned {} repair action(s) for {} (authoritative={:?})",
            actions.len(),
            subject,
            winner
        );

        Ok(RepairPlan {
            subject: subject.clone(),
            resolution,
            authoritative: winner,
            actions,
        })
    }
}
