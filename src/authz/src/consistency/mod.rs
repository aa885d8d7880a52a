//! Consistency checking and repair across role sources
//!
//! A subject's roles live in more than one independently writable source
//! (the role-assignment table and the profile's role field). The
//! [`ConsistencyChecker`] detects when they disagree, the [`RepairPlanner`]
//! proposes writes that reconcile them, and the [`Repairer`] applies and
//! verifies those writes one subject at a time.
//!
//! ```text
//! store ──fetch──▶ checker ──issue──▶ repairer ──plan──▶ store.write
//!                                        │                   │
//!                                        └──── verify ◀──────┘
//!                                        │
//!                                        └──▶ RepairListener (cache invalidation)
//! ```

pub mod checker;
pub mod metrics;
pub mod planner;
pub mod repairer;
pub mod types;

pub use checker::ConsistencyChecker;
pub use metrics::{ConsistencyMetrics, MetricsCollector};
pub use planner::RepairPlanner;
pub use repairer::{RepairContention, Repairer};
pub use types::{
    ConsistencyCheck, ConsistencyIssue, RepairAction, RepairEvent, RepairKind, RepairListener,
    RepairOutcome, RepairPlan, Severity, SourceLayout, SourceSnapshot,
};
