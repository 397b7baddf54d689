//! libSQL backend: async `Database` trait implementation.
//!
//! Leads and human requests are stored as a JSON payload next to the few
//! columns that are queried or constrained directly. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::model::{Lead, PendingHumanRequest};
use crate::notify::events::ActivityEntry;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a single-column `SELECT payload ...` query and decode every row.
    async fn query_payloads<T: DeserializeOwned>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let payload: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?;
                    match serde_json::from_str::<T>(&payload) {
                        Ok(value) => out.push(value),
                        Err(e) => warn!(op, error = %e, "Skipping undecodable row"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn upsert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let (city_key, place_id) = lead.natural_key();
        self.conn()
            .execute(
                "INSERT INTO leads (id, place_id, city, status, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![
                    lead.id.to_string(),
                    place_id,
                    city_key,
                    lead.status.as_str(),
                    to_json(lead)?,
                    lead.created_at.to_rfc3339(),
                    lead.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_lead: {e}")))?;

        debug!(lead_id = %lead.id, status = %lead.status, "Lead persisted");
        Ok(())
    }

    async fn load_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        self.query_payloads(
            "load_leads",
            "SELECT payload FROM leads ORDER BY created_at ASC",
            (),
        )
        .await
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut leads: Vec<Lead> = self
            .query_payloads(
                "get_lead",
                "SELECT payload FROM leads WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok(leads.pop())
    }

    async fn clear_leads(&self) -> Result<usize, DatabaseError> {
        let removed = self
            .conn()
            .execute("DELETE FROM leads", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_leads: {e}")))?;
        Ok(removed as usize)
    }

    // ── Human requests ──────────────────────────────────────────────

    async fn upsert_human_request(
        &self,
        request: &PendingHumanRequest,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO human_requests (request_id, lead_id, status, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(request_id) DO UPDATE SET
                    status = excluded.status,
                    payload = excluded.payload",
                params![
                    request.request_id.clone(),
                    request.lead_id.to_string(),
                    request.status.as_str(),
                    to_json(request)?,
                    request.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_human_request: {e}")))?;
        Ok(())
    }

    async fn load_human_requests(&self) -> Result<Vec<PendingHumanRequest>, DatabaseError> {
        self.query_payloads(
            "load_human_requests",
            "SELECT payload FROM human_requests ORDER BY created_at ASC",
            (),
        )
        .await
    }

    async fn clear_human_requests(&self) -> Result<usize, DatabaseError> {
        let removed = self
            .conn()
            .execute("DELETE FROM human_requests", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_human_requests: {e}")))?;
        Ok(removed as usize)
    }

    // ── Activity log ────────────────────────────────────────────────

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO activity_log (event_type, lead_id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.event_type.clone(),
                    opt_text_owned(entry.lead_id.map(|id| id.to_string())),
                    to_json(entry)?,
                    entry.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_activity: {e}")))?;
        Ok(())
    }

    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, DatabaseError> {
        self.query_payloads(
            "recent_activity",
            "SELECT payload FROM (SELECT id, payload FROM activity_log ORDER BY id DESC LIMIT ?1) ORDER BY id ASC",
            params![limit as i64],
        )
        .await
    }
}
