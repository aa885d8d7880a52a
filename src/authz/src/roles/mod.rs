//! Role resolution
//!
//! Merges role records from every source into a de-duplicated [`RoleSet`]
//! and derives the subject's primary role from a configured precedence
//! order.
//!
//! # Example
//!
//! ```rust
//! use haven_authz::roles::RoleResolver;
//! use haven_authz::types::{Role, RoleRecord, RoleSource, SubjectId};
//!
//! let resolver = RoleResolver::new();
//! let subject = SubjectId::new("user:alice");
//! let records = vec![
//!     RoleRecord::new("user:alice", Role::Patient, RoleSource::ProfileField),
//!     RoleRecord::new("user:alice", Role::Therapist, RoleSource::AssignmentTable),
//! ];
//!
//! let resolution = resolver.resolve(&subject, &records).unwrap();
//! assert_eq!(resolution.primary, Role::Therapist);
//! assert_eq!(resolution.roles.len(), 2);
//! ```

pub mod resolver;
pub mod types;

#[cfg(test)]
mod tests;

pub use resolver::RoleResolver;
pub use types::{Resolution, RolePrecedence, RoleSet};
