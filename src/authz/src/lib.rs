//! # Haven Authorization Engine
//!
//! Role resolution, capability checks, field-level access policy and
//! role-source consistency repair for the Haven therapy platform.
//!
//! ## Features
//!
//! - **Role resolution** merging role records from every source into one
//!   role set and a deterministic primary role
//! - **Capability checks** over roles and a static permission table
//! - **Field access policy** with ordered, first-match-wins rules that fail
//!   closed
//! - **Consistency repair** between the role-assignment table and the
//!   profile role field, serialized per subject
//! - **Storage-agnostic**: all I/O goes through [`RoleRecordStore`]
//!
//! ## Example
//!
//! ```rust
//! use haven_authz::{EngineConfig, InMemoryRoleStore, ConsistencyCheck, RepairOutcome};
//! use haven_authz::types::{Role, RoleRecord, RoleSource, SubjectId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryRoleStore::from_records(vec![
//!         RoleRecord::new("user:alice", Role::Therapist, RoleSource::AssignmentTable),
//!     ]));
//!     let engine = EngineConfig::default().build(store)?;
//!     let subject = SubjectId::new("user:alice");
//!
//!     if let ConsistencyCheck::Divergent(issue) = engine.checker.check_consistency(&subject).await? {
//!         let outcome = engine.repairer.repair(&issue).await?;
//!         assert!(matches!(outcome, RepairOutcome::Repaired { .. }));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod config;
pub mod consistency;
pub mod error;
pub mod field_policy;
pub mod guard;
pub mod roles;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use capability::{Capabilities, PermissionTable};
pub use config::{Engine, EngineConfig};
pub use consistency::{
    ConsistencyCheck, ConsistencyChecker, ConsistencyIssue, RepairAction, RepairContention,
    RepairEvent, RepairKind, RepairListener, RepairOutcome, RepairPlan, Repairer, Severity,
};
pub use error::{AuthzError, Result};
pub use field_policy::{FieldAccess, FieldContext, FieldPolicy, FieldRule};
pub use guard::{AuthStatus, Guard, GuardDecision, GuardMode, Requirement, StatusCache};
pub use roles::{Resolution, RolePrecedence, RoleResolver, RoleSet};
pub use store::{InMemoryRoleStore, RoleRecordStore};
pub use types::{Role, RoleRecord, RoleSource, SubjectId};

#[allow(deprecated)]
pub use capability::UserRoles;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
