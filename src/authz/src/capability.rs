//! Capability evaluation over a resolved role set
//!
//! [`Capabilities`] answers role-membership and permission questions for one
//! subject. Permission checks go through a [`PermissionTable`], a static
//! role → permissions map that must cover the whole closed role set.

use crate::error::{AuthzError, Result};
use crate::roles::RoleSet;
use crate::types::Role;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::error;

/// Static role → permission-string table with a precomputed reverse index
#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    entries: HashMap<Role, BTreeSet<String>>,
    /// permission → roles granting it
    index: HashMap<String, BTreeSet<Role>>,
}

impl PermissionTable {
    /// Build a table that maps every role
    ///
    /// Fails with `UnmappedRole` naming the first role without an entry. An
    /// entry may be empty; a missing entry is a configuration gap.
    pub fn new<I, P, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Role, P)>,
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = Self::partial(entries);
        if let Some(role) = Role::ALL.into_iter().find(|r| !table.entries.contains_key(r)) {
            return Err(AuthzError::UnmappedRole(role));
        }
        Ok(table)
    }

    /// Build a table without the totality check
    pub fn partial<I, P, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Role, P)>,
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (role, permissions) in entries {
            let set = table.entries.entry(role).or_default();
            for permission in permissions {
                let permission = permission.into();
                table
                    .index
                    .entry(permission.clone())
                    .or_default()
                    .insert(role);
                set.insert(permission);
            }
        }
        table
    }

    /// Default permissions of the therapy platform
    pub fn standard() -> Self {
        Self::partial([
            (
                Role::Patient,
                vec![
                    "profile:read",
                    "profile:write",
                    "appointments:book",
                    "sessions:join",
                    "messages:send",
                ],
            ),
            (
                Role::Therapist,
                vec![
                    "profile:read",
                    "profile:write",
                    "appointments:manage",
                    "sessions:host",
                    "sessions:join",
                    "messages:send",
                    "patients:read",
                    "notes:write",
                ],
            ),
            (
                Role::Admin,
                vec![
                    "profile:read",
                    "users:read",
                    "users:manage",
                    "therapists:verify",
                    "reports:read",
                ],
            ),
            (
                Role::SuperAdmin,
                vec![
                    "profile:read",
                    "users:read",
                    "users:manage",
                    "therapists:verify",
                    "reports:read",
                    "roles:manage",
                    "roles:repair",
                    "system:configure",
                ],
            ),
        ])
    }

    /// Permissions of a role, or `None` if the role is unmapped
    pub fn permissions_for(&self, role: Role) -> Option<&BTreeSet<String>> {
        self.entries.get(&role)
    }

    /// Roles whose permission set contains `permission`
    pub fn roles_granting(&self, permission: &str) -> Option<&BTreeSet<Role>> {
        self.index.get(permission)
    }

    /// Whether every role has an entry
    pub fn is_total(&self) -> bool {
        Role::ALL.iter().all(|r| self.entries.contains_key(r))
    }
}

/// Role and permission queries for one subject
#[derive(Debug, Clone)]
pub struct Capabilities {
    roles: RoleSet,
    table: Arc<PermissionTable>,
}

/// Former name of [`Capabilities`]
#[deprecated(since = "0.1.0", note = "use `Capabilities`")]
pub type UserRoles = Capabilities;

impl Capabilities {
    pub fn new(roles: RoleSet, table: Arc<PermissionTable>) -> Self {
        Self { roles, table }
    }

    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(role)
    }

    /// True iff at least one of `roles` is held
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| self.roles.contains(*r))
    }

    /// True iff every role in `roles` is held; vacuously true when empty
    pub fn has_all_roles(&self, roles: &[Role]) -> bool {
        roles.iter().all(|r| self.roles.contains(*r))
    }

    pub fn is_admin(&self) -> bool {
        self.has_any_role(&[Role::Admin, Role::SuperAdmin])
    }

    /// True iff any held role grants `permission`
    ///
    /// Fails with `UnmappedRole` if a held role has no table entry.
    pub fn has_permission(&self, permission: &str) -> Result<bool> {
        self.check_mapped()?;

        Ok(self
            .table
            .roles_granting(permission)
            .map(|granting| self.roles.iter().any(|r| granting.contains(&r)))
            .unwrap_or(false))
    }

    /// Effective permission set of the subject
    pub fn permissions(&self) -> Result<BTreeSet<String>> {
        self.check_mapped()?;

        let mut permissions = BTreeSet::new();
        for role in self.roles.iter() {
            if let Some(set) = self.table.permissions_for(role) {
                permissions.extend(set.iter().cloned());
            }
        }
        Ok(permissions)
    }

    fn check_mapped(&self) -> Result<()> {
        for role in self.roles.iter() {
            if self.table.permissions_for(role).is_none() {
                error!("Permission table has no entry for held role '{}'", role);
                return Err(AuthzError::UnmappedRole(role));
            }
        }
        Ok(())
    }
}
