//! Resolved role set and precedence types

use crate::error::{AuthzError, Result};
use crate::types::{Role, SubjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// De-duplicated, non-empty set of roles held by a subject
///
/// The only constructors reject empty input, so a `RoleSet` in hand always
/// holds at least one role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Role>", into = "Vec<Role>")]
pub struct RoleSet {
    roles: BTreeSet<Role>,
}

impl RoleSet {
    /// Build a role set, returning `None` when no role was given
    pub fn from_roles(roles: impl IntoIterator<Item = Role>) -> Option<Self> {
        let roles: BTreeSet<Role> = roles.into_iter().collect();
        if roles.is_empty() {
            None
        } else {
            Some(Self { roles })
        }
    }

    /// Build a role set for `subject`, failing with `NoRoleAssigned` when empty
    pub fn new(subject: &SubjectId, roles: impl IntoIterator<Item = Role>) -> Result<Self> {
        Self::from_roles(roles).ok_or_else(|| AuthzError::NoRoleAssigned(subject.clone()))
    }

    pub fn contains(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        self.roles.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    /// Always false for a constructed set
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Roles as an ordered vector
    pub fn to_vec(&self) -> Vec<Role> {
        self.roles.iter().copied().collect()
    }

    pub fn as_set(&self) -> &BTreeSet<Role> {
        &self.roles
    }
}

impl TryFrom<Vec<Role>> for RoleSet {
    type Error = AuthzError;

    fn try_from(roles: Vec<Role>) -> Result<Self> {
        Self::from_roles(roles)
            .ok_or_else(|| AuthzError::InvalidInput("Role set cannot be empty".to_string()))
    }
}

impl From<RoleSet> for Vec<Role> {
    fn from(set: RoleSet) -> Self {
        set.roles.into_iter().collect()
    }
}

/// Total precedence order over the closed role set, highest first
///
/// The primary role of a role set is the member that appears earliest in
/// this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Role>", into = "Vec<Role>")]
pub struct RolePrecedence {
    order: Vec<Role>,
}

impl RolePrecedence {
    /// Create a precedence order; every role must appear exactly once
    pub fn new(order: Vec<Role>) -> Result<Self> {
        for role in Role::ALL {
            let count = order.iter().filter(|r| **r == role).count();
            if count == 0 {
                return Err(AuthzError::InvalidConfig(format!(
                    "Role precedence is missing role '{}'",
                    role
                )));
            }
            if count > 1 {
                return Err(AuthzError::InvalidConfig(format!(
                    "Role precedence lists role '{}' {} times",
                    role, count
                )));
            }
        }

        Ok(Self { order })
    }

    /// Position of `role` in the order (0 = highest)
    pub fn rank(&self, role: Role) -> usize {
        self.order
            .iter()
            .position(|r| *r == role)
            .unwrap_or(self.order.len())
    }

    /// Choose the primary role of a role set
    pub fn primary(&self, roles: &RoleSet) -> Result<Role> {
        self.order
            .iter()
            .copied()
            .find(|role| roles.contains(*role))
            .ok_or_else(|| {
                AuthzError::InvalidConfig("Role precedence does not cover role set".to_string())
            })
    }

    pub fn order(&self) -> &[Role] {
        &self.order
    }
}

impl Default for RolePrecedence {
    fn default() -> Self {
        Self {
            order: vec![Role::SuperAdmin, Role::Admin, Role::Therapist, Role::Patient],
        }
    }
}

impl TryFrom<Vec<Role>> for RolePrecedence {
    type Error = AuthzError;

    fn try_from(order: Vec<Role>) -> Result<Self> {
        Self::new(order)
    }
}

impl From<RolePrecedence> for Vec<Role> {
    fn from(precedence: RolePrecedence) -> Self {
        precedence.order
    }
}

/// Outcome of role resolution for one subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Subject that was resolved
    pub subject: SubjectId,

    /// Union of all asserted roles
    pub roles: RoleSet,

    /// Role chosen by precedence; always a member of `roles`
    pub primary: Role,
}
