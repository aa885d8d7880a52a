//! Field-level access policy
//!
//! A [`FieldPolicy`] is an ordered list of [`FieldRule`]s. Each rule matches
//! on the subject's roles, a field-name pattern and optional context
//! key/value pairs. Rules are evaluated in declaration order and the first
//! match wins; when nothing matches, the field is hidden and read-only.

use crate::error::{AuthzError, Result};
use crate::roles::RoleSet;
use crate::types::Role;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Coarse access level a rule grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Hidden,
    ReadOnly,
    Writable,
}

/// Access decision for one field
///
/// Fields are private: the constructors are the only way to build a value,
/// so a hidden field is always read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFieldAccess")]
pub struct FieldAccess {
    hidden: bool,
    read_only: bool,
}

#[derive(Deserialize)]
struct RawFieldAccess {
    hidden: bool,
    read_only: bool,
}

impl TryFrom<RawFieldAccess> for FieldAccess {
    type Error = AuthzError;

    fn try_from(raw: RawFieldAccess) -> Result<Self> {
        if raw.hidden && !raw.read_only {
            return Err(AuthzError::InvalidInput(
                "A hidden field must also be read-only".to_string(),
            ));
        }
        Ok(Self {
            hidden: raw.hidden,
            read_only: raw.read_only,
        })
    }
}

impl FieldAccess {
    /// Invisible and not writable; the fail-closed default
    pub const fn hidden() -> Self {
        Self {
            hidden: true,
            read_only: true,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            hidden: false,
            read_only: true,
        }
    }

    pub const fn writable() -> Self {
        Self {
            hidden: false,
            read_only: false,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn can_read(&self) -> bool {
        !self.hidden
    }

    pub fn can_write(&self) -> bool {
        !self.hidden && !self.read_only
    }
}

impl From<AccessLevel> for FieldAccess {
    fn from(level: AccessLevel) -> Self {
        match level {
            AccessLevel::Hidden => Self::hidden(),
            AccessLevel::ReadOnly => Self::read_only(),
            AccessLevel::Writable => Self::writable(),
        }
    }
}

/// Predicate over the subject's role set
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleMatcher {
    /// Matches every subject
    #[default]
    Any,
    /// Subject holds this role
    Role(Role),
    /// Subject holds at least one of these roles
    AnyOf(Vec<Role>),
    /// Subject holds every one of these roles
    AllOf(Vec<Role>),
}

impl RoleMatcher {
    pub fn matches(&self, roles: &RoleSet) -> bool {
        match self {
            RoleMatcher::Any => true,
            RoleMatcher::Role(role) => roles.contains(*role),
            RoleMatcher::AnyOf(any) => any.iter().any(|r| roles.contains(*r)),
            RoleMatcher::AllOf(all) => all.iter().all(|r| roles.contains(*r)),
        }
    }
}

/// Request context a field is rendered in (e.g. `owner=self`, `mode=edit`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldContext {
    values: HashMap<String, String>,
}

impl FieldContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// One policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Role predicate
    #[serde(default)]
    pub roles: RoleMatcher,

    /// Field-name pattern: `*`, `prefix.*`, `*.suffix` or an exact name
    pub field: String,

    /// Context values that must all be present; empty matches any context
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,

    /// Access granted when the rule matches
    pub access: AccessLevel,
}

impl FieldRule {
    pub fn new(roles: RoleMatcher, field: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            roles,
            field: field.into(),
            context: BTreeMap::new(),
            access,
        }
    }

    /// Require a context value for the rule to match
    pub fn when(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    fn context_matches(&self, context: &FieldContext) -> bool {
        self.context
            .iter()
            .all(|(key, value)| context.get(key) == Some(value.as_str()))
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: FieldRule,
    pattern: Regex,
}

/// Ordered, first-match-wins field access policy
#[derive(Debug, Clone, Default)]
pub struct FieldPolicy {
    rules: Vec<CompiledRule>,
}

impl FieldPolicy {
    /// Compile a policy; rule order is preserved exactly
    pub fn new(rules: Vec<FieldRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let pattern = Self::compile_pattern(&rule.field)?;
                Ok(CompiledRule { rule, pattern })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Rules shipped for the patient record screens
    pub fn standard_rules() -> Vec<FieldRule> {
        use AccessLevel::*;
        use RoleMatcher as M;

        vec![
            FieldRule::new(M::Any, "id", ReadOnly),
            FieldRule::new(M::Any, "created_at", ReadOnly),
            FieldRule::new(M::Role(Role::SuperAdmin), "*", Writable),
            FieldRule::new(M::Role(Role::Admin), "role", ReadOnly),
            FieldRule::new(M::Role(Role::Admin), "clinical.*", Hidden),
            FieldRule::new(M::Role(Role::Admin), "*", Writable),
            FieldRule::new(M::Role(Role::Therapist), "clinical.*", Writable)
                .when("relationship", "assigned"),
            FieldRule::new(M::Role(Role::Therapist), "clinical.*", Hidden),
            FieldRule::new(M::Role(Role::Therapist), "contact.*", ReadOnly)
                .when("relationship", "assigned"),
            FieldRule::new(M::Role(Role::Therapist), "profile.*", ReadOnly),
            FieldRule::new(M::Role(Role::Patient), "clinical.notes", Hidden),
            FieldRule::new(M::Role(Role::Patient), "clinical.*", ReadOnly),
            FieldRule::new(M::Role(Role::Patient), "profile.*", Writable).when("owner", "self"),
            FieldRule::new(M::Role(Role::Patient), "contact.*", Writable).when("owner", "self"),
            FieldRule::new(M::Role(Role::Patient), "role", ReadOnly),
        ]
    }

    pub fn standard() -> Result<Self> {
        Self::new(Self::standard_rules())
    }

    /// Decide access to `field`; never fails, defaults to hidden
    pub fn get_field_access(
        &self,
        roles: &RoleSet,
        field: &str,
        context: &FieldContext,
    ) -> FieldAccess {
        for (position, compiled) in self.rules.iter().enumerate() {
            let rule = &compiled.rule;
            if rule.roles.matches(roles)
                && compiled.pattern.is_match(field)
                && rule.context_matches(context)
            {
                debug!(
                    "Field '{}' matched rule #{} ({:?})",
                    field, position, rule.access
                );
                return rule.access.into();
            }
        }

        debug!("Field '{}' matched no rule, hiding", field);
        FieldAccess::hidden()
    }

    pub fn can_read_field(&self, roles: &RoleSet, field: &str, context: &FieldContext) -> bool {
        self.get_field_access(roles, field, context).can_read()
    }

    pub fn can_write_field(&self, roles: &RoleSet, field: &str, context: &FieldContext) -> bool {
        self.get_field_access(roles, field, context).can_write()
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> impl Iterator<Item = &FieldRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    fn compile_pattern(pattern: &str) -> Result<Regex> {
        if pattern.is_empty() {
            return Err(AuthzError::InvalidConfig(
                "Field pattern cannot be empty".to_string(),
            ));
        }

        let regex_pattern = regex::escape(pattern).replace(r"\*", ".*");
        Regex::new(&format!("^{}$", regex_pattern)).map_err(|e| {
            AuthzError::InvalidConfig(format!("Invalid field pattern '{}': {}", pattern, e))
        })
    }
}
