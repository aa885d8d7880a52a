//! Consistency checker
//!
//! Compares the authoritative role source against every other configured
//! source and classifies the divergence. Checking only reads.

use super::metrics::MetricsCollector;
use super::types::{ConsistencyCheck, ConsistencyIssue, Severity, SourceLayout, SourceSnapshot};
use crate::error::{AuthzError, Result};
use crate::roles::{RoleResolver, RoleSet};
use crate::store::RoleRecordStore;
use crate::types::{RoleRecord, SubjectId};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Detects divergence between a subject's role sources
#[derive(Clone)]
pub struct ConsistencyChecker {
    store: Arc<dyn RoleRecordStore>,
    resolver: RoleResolver,
    layout: SourceLayout,
    metrics: Arc<MetricsCollector>,
}

impl ConsistencyChecker {
    pub fn new(store: Arc<dyn RoleRecordStore>, resolver: RoleResolver, layout: SourceLayout) -> Self {
        Self {
            store,
            resolver,
            layout,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Share a metrics collector with other components
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    pub fn resolver(&self) -> &RoleResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Fetch a subject's records and classify them
    pub async fn check_consistency(&self, subject: &SubjectId) -> Result<ConsistencyCheck> {
        let records = self.store.fetch_records(subject).await?;
        let check = self.classify(subject, &records)?;

        self.metrics.record_check(check.issue().map(|i| i.severity));
        if let ConsistencyCheck::Divergent(issue) = &check {
            warn!(
                "Role sources diverge for {}: {} {:?} vs {} {:?} ({:?})",
                subject, issue.source_a, issue.roles_a, issue.source_b, issue.roles_b, issue.severity
            );
        }

        Ok(check)
    }

    /// Classify records already in hand
    ///
    /// Fails with `NoRoleAssigned` when no source holds any role.
    pub fn classify(&self, subject: &SubjectId, records: &[RoleRecord]) -> Result<ConsistencyCheck> {
        let snapshots = self.layout.snapshots(subject, records);

        let union: BTreeSet<_> = snapshots.iter().flat_map(|s| s.roles.iter().copied()).collect();
        if union.is_empty() {
            return Err(AuthzError::NoRoleAssigned(subject.clone()));
        }

        let authoritative = snapshots
            .iter()
            .find(|s| s.source == self.layout.authoritative())
            .ok_or_else(|| {
                AuthzError::InvalidConfig("Authoritative source has no snapshot".to_string())
            })?;

        // Most severe divergence wins; ties go to the first in source order
        let mut worst: Option<ConsistencyIssue> = None;
        for other in snapshots.iter().filter(|s| s.source != authoritative.source) {
            if other.roles == authoritative.roles {
                continue;
            }

            let severity = self.severity(authoritative, other)?;
            if worst.as_ref().map_or(true, |w| severity > w.severity) {
                worst = Some(ConsistencyIssue {
                    subject: subject.clone(),
                    source_a: authoritative.source,
                    source_b: other.source,
                    roles_a: authoritative.roles.iter().copied().collect(),
                    roles_b: other.roles.iter().copied().collect(),
                    severity,
                    detected_at: Utc::now(),
                });
            }
        }

        match worst {
            Some(issue) => Ok(ConsistencyCheck::Divergent(issue)),
            None => {
                debug!("Role sources agree for {}", subject);
                let resolution = self.resolver.resolve_roles(subject, union)?;
                Ok(ConsistencyCheck::Consistent(resolution))
            }
        }
    }

    /// Severity of a divergence between two differing snapshots
    pub(crate) fn severity(&self, a: &SourceSnapshot, b: &SourceSnapshot) -> Result<Severity> {
        let (Some(roles_a), Some(roles_b)) = (
            RoleSet::from_roles(a.roles.iter().copied()),
            RoleSet::from_roles(b.roles.iter().copied()),
        ) else {
            return Ok(Severity::MissingRole);
        };

        let precedence = self.resolver.precedence();
        if precedence.primary(&roles_a)? != precedence.primary(&roles_b)? {
            Ok(Severity::ConflictingPrimary)
        } else {
            Ok(Severity::MissingRole)
        }
    }
}
