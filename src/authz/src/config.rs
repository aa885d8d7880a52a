//! Engine configuration loading and validation

use crate::capability::PermissionTable;
use crate::consistency::{ConsistencyChecker, RepairContention, RepairListener, Repairer, SourceLayout};
use crate::error::{AuthzError, Result};
use crate::field_policy::{FieldPolicy, FieldRule};
use crate::roles::{RolePrecedence, RoleResolver};
use crate::store::RoleRecordStore;
use crate::types::{Role, RoleSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Role precedence, highest first; must list every role once
    #[serde(default)]
    pub precedence: RolePrecedence,

    #[serde(default)]
    pub consistency: ConsistencySection,

    #[serde(default)]
    pub repair: RepairSection,

    /// Role tag → permission strings
    #[serde(default = "default_permissions")]
    pub permissions: BTreeMap<String, Vec<String>>,

    /// Field rules in evaluation order
    #[serde(default = "FieldPolicy::standard_rules")]
    pub field_rules: Vec<FieldRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConsistencySection {
    #[serde(default = "default_sources")]
    pub sources: Vec<RoleSource>,
    #[serde(default = "default_authoritative")]
    pub authoritative: RoleSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionMode {
    #[default]
    Reject,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RepairSection {
    #[serde(default)]
    pub contention: ContentionMode,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for ConsistencySection {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            authoritative: default_authoritative(),
        }
    }
}

impl Default for RepairSection {
    fn default() -> Self {
        Self {
            contention: ContentionMode::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl RepairSection {
    pub fn contention(&self) -> RepairContention {
        match self.contention {
            ContentionMode::Reject => RepairContention::Reject,
            ContentionMode::Wait => {
                RepairContention::Wait(Duration::from_millis(self.wait_timeout_ms))
            }
        }
    }
}

fn default_sources() -> Vec<RoleSource> {
    vec![RoleSource::AssignmentTable, RoleSource::ProfileField]
}
fn default_authoritative() -> RoleSource { RoleSource::AssignmentTable }
fn default_wait_timeout_ms() -> u64 { 2_000 }

fn default_permissions() -> BTreeMap<String, Vec<String>> {
    let table = PermissionTable::standard();
    Role::ALL
        .into_iter()
        .map(|role| {
            let permissions = table
                .permissions_for(role)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            (role.as_str().to_string(), permissions)
        })
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            precedence: RolePrecedence::default(),
            consistency: ConsistencySection::default(),
            repair: RepairSection::default(),
            permissions: default_permissions(),
            field_rules: FieldPolicy::standard_rules(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.source_layout()?;
        self.permission_table()?;
        FieldPolicy::new(self.field_rules.clone())?;

        if self.repair.contention == ContentionMode::Wait && self.repair.wait_timeout_ms == 0 {
            return Err(AuthzError::InvalidConfig(
                "repair.wait_timeout_ms must be positive in wait mode".to_string(),
            ));
        }

        Ok(())
    }

    pub fn source_layout(&self) -> Result<SourceLayout> {
        SourceLayout::new(self.consistency.sources.clone(), self.consistency.authoritative)
    }

    /// Build the permission table; every role must be mapped
    pub fn permission_table(&self) -> Result<PermissionTable> {
        let entries = self
            .permissions
            .iter()
            .map(|(tag, permissions)| Ok((tag.parse::<Role>()?, permissions.clone())))
            .collect::<Result<Vec<_>>>()?;

        PermissionTable::new(entries)
    }

    /// Wire every engine component to `store`
    pub fn build(&self, store: Arc<dyn RoleRecordStore>) -> Result<Engine> {
        self.validate()?;

        let resolver = RoleResolver::with_precedence(self.precedence.clone());
        let checker = ConsistencyChecker::new(store.clone(), resolver.clone(), self.source_layout()?);
        let repairer = Repairer::new(store.clone(), checker.clone())
            .with_contention(self.repair.contention());

        info!(
            "Engine configured: authoritative={}, sources={:?}, contention={:?}, field_rules={}",
            self.consistency.authoritative,
            self.consistency.sources,
            self.repair.contention,
            self.field_rules.len()
        );

        Ok(Engine {
            resolver,
            permissions: Arc::new(self.permission_table()?),
            field_policy: FieldPolicy::new(self.field_rules.clone())?,
            checker,
            repairer,
            store,
        })
    }
}

/// Every engine component, wired to one store
pub struct Engine {
    pub resolver: RoleResolver,
    pub permissions: Arc<PermissionTable>,
    pub field_policy: FieldPolicy,
    pub checker: ConsistencyChecker,
    pub repairer: Repairer,
    pub store: Arc<dyn RoleRecordStore>,
}

impl Engine {
    /// Register a repair listener, e.g. a status cache
    pub fn with_listener(mut self, listener: Arc<dyn RepairListener>) -> Self {
        self.repairer = self.repairer.with_listener(listener);
        self
    }
}
