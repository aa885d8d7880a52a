//! Role resolver
//!
//! Merges raw role records from every source into a canonical [`RoleSet`]
//! and picks the primary role by precedence. Resolution is pure and
//! synchronous, so it is safe to call speculatively (e.g. to preview the
//! effect of a repair).

use super::types::{Resolution, RolePrecedence, RoleSet};
use crate::error::Result;
use crate::types::{Role, RoleRecord, SubjectId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves role records into a [`Resolution`]
///
/// # Thread Safety
///
/// The resolver holds only an immutable precedence order behind an `Arc`
/// and can be cloned freely across tasks.
#[derive(Debug, Clone, Default)]
pub struct RoleResolver {
    precedence: Arc<RolePrecedence>,
}

impl RoleResolver {
    /// Create a resolver with the default precedence order
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resolver with a custom precedence order
    pub fn with_precedence(precedence: RolePrecedence) -> Self {
        Self {
            precedence: Arc::new(precedence),
        }
    }

    pub fn precedence(&self) -> &RolePrecedence {
        &self.precedence
    }

    /// Resolve a subject's records into a role set and primary role
    ///
    /// Records naming a different subject are skipped. Fails with
    /// `NoRoleAssigned` when no role remains.
    pub fn resolve(&self, subject: &SubjectId, records: &[RoleRecord]) -> Result<Resolution> {
        let roles = records.iter().filter_map(|record| {
            if &record.subject == subject {
                Some(record.role)
            } else {
                warn!(
                    "Ignoring record for subject {} while resolving {}",
                    record.subject, subject
                );
                None
            }
        });

        self.resolve_roles(subject, roles)
    }

    /// Resolve an already-collected role list
    pub fn resolve_roles(
        &self,
        subject: &SubjectId,
        roles: impl IntoIterator<Item = Role>,
    ) -> Result<Resolution> {
        let roles = RoleSet::new(subject, roles)?;
        let primary = self.precedence.primary(&roles)?;

        debug!(
            "Resolved subject {}: roles={:?}, primary={}",
            subject,
            roles.to_vec(),
            primary
        );

        Ok(Resolution {
            subject: subject.clone(),
            roles,
            primary,
        })
    }
}
