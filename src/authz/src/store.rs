//! Role record storage
//!
//! The engine never talks to a database directly. Every read and write goes
//! through [`RoleRecordStore`], which callers implement over their own
//! persistence layer.

use crate::error::Result;
use crate::types::{Role, RoleRecord, RoleSource, SubjectId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Role record store trait
#[async_trait]
pub trait RoleRecordStore: Send + Sync {
    /// Fetch every record held for `subject`, from all sources
    async fn fetch_records(&self, subject: &SubjectId) -> Result<Vec<RoleRecord>>;

    /// Replace the roles `source` holds for `subject` with exactly `roles`
    async fn write_record(&self, subject: &SubjectId, source: RoleSource, roles: &[Role]) -> Result<()>;
}

/// In-memory role record store
#[derive(Default)]
pub struct InMemoryRoleStore {
    records: Arc<RwLock<HashMap<SubjectId, Vec<RoleRecord>>>>,
    writes: AtomicUsize,
}

impl InMemoryRoleStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with records
    pub fn from_records(records: impl IntoIterator<Item = RoleRecord>) -> Self {
        let mut map: HashMap<SubjectId, Vec<RoleRecord>> = HashMap::new();
        for record in records {
            map.entry(record.subject.clone()).or_default().push(record);
        }

        Self {
            records: Arc::new(RwLock::new(map)),
            writes: AtomicUsize::new(0),
        }
    }

    /// Add one record without counting it as a write
    pub async fn insert(&self, record: RoleRecord) {
        let mut records = self.records.write().await;
        records.entry(record.subject.clone()).or_default().push(record);
    }

    /// Subjects with at least one record, sorted
    pub async fn subjects(&self) -> Vec<SubjectId> {
        let records = self.records.read().await;
        let mut subjects: Vec<SubjectId> = records.keys().cloned().collect();
        subjects.sort();
        subjects
    }

    /// Every record in the store
    pub async fn all_records(&self) -> Vec<RoleRecord> {
        let records = self.records.read().await;
        records.values().flatten().cloned().collect()
    }

    /// Number of `write_record` calls served
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoleRecordStore for InMemoryRoleStore {
    async fn fetch_records(&self, subject: &SubjectId) -> Result<Vec<RoleRecord>> {
        let records = self.records.read().await;
        Ok(records.get(subject).cloned().unwrap_or_default())
    }

    async fn write_record(&self, subject: &SubjectId, source: RoleSource, roles: &[Role]) -> Result<()> {
        let mut records = self.records.write().await;
        let now = Utc::now();

        let entry = records.entry(subject.clone()).or_default();
        entry.retain(|r| r.source != source);
        for role in roles {
            entry.push(RoleRecord::new(subject.clone(), *role, source).recorded_at(now));
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
