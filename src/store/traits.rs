//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::model::{Lead, PendingHumanRequest};
use crate::notify::events::ActivityEntry;

/// Backend-agnostic database trait covering leads, human requests and the audit log.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert or replace the full lead record.
    async fn upsert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    /// Load every lead, oldest first.
    async fn load_leads(&self) -> Result<Vec<Lead>, DatabaseError>;

    /// Get a single lead.
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Delete every lead. Returns the number removed.
    async fn clear_leads(&self) -> Result<usize, DatabaseError>;

    // ── Human requests ──────────────────────────────────────────────

    async fn upsert_human_request(&self, request: &PendingHumanRequest)
    -> Result<(), DatabaseError>;

    async fn load_human_requests(&self) -> Result<Vec<PendingHumanRequest>, DatabaseError>;

    async fn clear_human_requests(&self) -> Result<usize, DatabaseError>;

    // ── Activity log ────────────────────────────────────────────────

    /// Append one audit entry. The persistent log is never capped.
    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError>;

    /// Most recent entries, newest last.
    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, DatabaseError>;
}
