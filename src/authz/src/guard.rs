//! Render guards and authentication status
//!
//! Consumers gate UI on an [`AuthStatus`], which keeps "still loading"
//! apart from "no role assigned". A [`Guard`] pairs one [`Requirement`]
//! with a [`GuardMode`]; bypass mode runs the same evaluation and only
//! overrides the final decision.

use crate::capability::{Capabilities, PermissionTable};
use crate::consistency::{RepairEvent, RepairListener};
use crate::error::{AuthzError, Result};
use crate::roles::{Resolution, RoleResolver};
use crate::store::RoleRecordStore;
use crate::types::{Role, SubjectId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Authentication status of a subject as seen by the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// Roles have not been resolved yet
    Loading,
    /// Resolution found no role
    Unauthorized,
    Authorized(Resolution),
}

impl AuthStatus {
    /// Map a resolution result to a status
    ///
    /// `NoRoleAssigned` becomes `Unauthorized`; any other error is returned.
    pub fn from_resolution(result: Result<Resolution>) -> Result<Self> {
        match result {
            Ok(resolution) => Ok(AuthStatus::Authorized(resolution)),
            Err(AuthzError::NoRoleAssigned(subject)) => {
                debug!("Subject {} has no role, treating as unauthorized", subject);
                Ok(AuthStatus::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        match self {
            AuthStatus::Authorized(resolution) => Some(resolution),
            _ => None,
        }
    }
}

/// Capability a guard checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Any resolved role
    Authenticated,
    Role(Role),
    AnyRole(Vec<Role>),
    AllRoles(Vec<Role>),
    Admin,
    Permission(String),
}

impl Requirement {
    /// Whether `caps` satisfies the requirement; permission errors deny
    pub fn is_met(&self, caps: &Capabilities) -> bool {
        match self {
            Requirement::Authenticated => true,
            Requirement::Role(role) => caps.has_role(*role),
            Requirement::AnyRole(roles) => caps.has_any_role(roles),
            Requirement::AllRoles(roles) => caps.has_all_roles(roles),
            Requirement::Admin => caps.is_admin(),
            Requirement::Permission(name) => match caps.has_permission(name) {
                Ok(granted) => granted,
                Err(e) => {
                    warn!("Permission check for '{}' failed closed: {}", name, e);
                    false
                }
            },
        }
    }
}

/// Whether a guard enforces its requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    #[default]
    Enforce,
    /// Always render; for development and tests
    Bypass,
}

/// What the consumer should render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Render the guarded content
    Render,
    /// Render the fallback
    Fallback,
    /// Status still loading; render a placeholder
    Pending,
}

/// One guard: a requirement plus an enforcement mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    pub requirement: Requirement,
    #[serde(default)]
    pub mode: GuardMode,
}

impl Guard {
    pub fn new(requirement: Requirement) -> Self {
        Self {
            requirement,
            mode: GuardMode::Enforce,
        }
    }

    pub fn with_mode(mut self, mode: GuardMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn evaluate(&self, status: &AuthStatus, table: &Arc<PermissionTable>) -> GuardDecision {
        let enforced = match status {
            AuthStatus::Loading => GuardDecision::Pending,
            AuthStatus::Unauthorized => GuardDecision::Fallback,
            AuthStatus::Authorized(resolution) => {
                let caps = Capabilities::new(resolution.roles.clone(), table.clone());
                if self.requirement.is_met(&caps) {
                    GuardDecision::Render
                } else {
                    GuardDecision::Fallback
                }
            }
        };

        match self.mode {
            GuardMode::Enforce => enforced,
            GuardMode::Bypass => {
                if enforced != GuardDecision::Render {
                    debug!("Guard {:?} bypassed ({:?})", self.requirement, enforced);
                }
                GuardDecision::Render
            }
        }
    }
}

/// Cached auth status per subject, invalidated when a repair lands
#[derive(Debug, Default)]
pub struct StatusCache {
    entries: DashMap<SubjectId, AuthStatus>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached status, or `Loading` when the subject was never resolved
    pub fn status(&self, subject: &SubjectId) -> AuthStatus {
        self.entries
            .get(subject)
            .map(|entry| entry.value().clone())
            .unwrap_or(AuthStatus::Loading)
    }

    /// Resolve `subject` from the store and cache the status
    pub async fn refresh(
        &self,
        subject: &SubjectId,
        store: &dyn RoleRecordStore,
        resolver: &RoleResolver,
    ) -> Result<AuthStatus> {
        let records = store.fetch_records(subject).await?;
        let status = AuthStatus::from_resolution(resolver.resolve(subject, &records))?;
        self.entries.insert(subject.clone(), status.clone());
        Ok(status)
    }

    pub fn invalidate(&self, subject: &SubjectId) -> bool {
        self.entries.remove(subject).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RepairListener for StatusCache {
    fn on_repaired(&self, event: &RepairEvent) {
        if self.invalidate(&event.subject) {
            debug!("Invalidated cached status for {}", event.subject);
        }
    }

    fn on_invalidated(&self, subject: &SubjectId) {
        if self.invalidate(subject) {
            debug!("Invalidated cached status for {} after failed repair", subject);
        }
    }
}
