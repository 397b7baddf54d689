//! Test double for the `Database` trait.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use super::{Database, LibSqlBackend};
use crate::error::DatabaseError;
use crate::leads::model::{Lead, PendingHumanRequest};
use crate::notify::events::ActivityEntry;

/// In-memory backend whose lead writes can be switched off.
pub(crate) struct FlakyDb {
    inner: LibSqlBackend,
    fail_lead_writes: AtomicBool,
}

impl FlakyDb {
    pub(crate) async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_lead_writes: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_lead_writes(&self, fail: bool) {
        self.fail_lead_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for FlakyDb {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn upsert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        if self.fail_lead_writes.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("disk full".into()));
        }
        self.inner.upsert_lead(lead).await
    }

    async fn load_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        self.inner.load_leads().await
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        self.inner.get_lead(id).await
    }

    async fn clear_leads(&self) -> Result<usize, DatabaseError> {
        self.inner.clear_leads().await
    }

    async fn upsert_human_request(&self, request: &PendingHumanRequest) -> Result<(), DatabaseError> {
        self.inner.upsert_human_request(request).await
    }

    async fn load_human_requests(&self) -> Result<Vec<PendingHumanRequest>, DatabaseError> {
        self.inner.load_human_requests().await
    }

    async fn clear_human_requests(&self) -> Result<usize, DatabaseError> {
        self.inner.clear_human_requests().await
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError> {
        self.inner.append_activity(entry).await
    }

    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, DatabaseError> {
        self.inner.recent_activity(limit).await
    }
}
