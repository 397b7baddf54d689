//! Human-in-the-loop gate.
//!
//! A stage that needs an outside decision parks the lead here. The request
//! stays pending until it is resolved through the API, cancelled by a reset
//! or, when a TTL is configured, expired by the sweep. A lead has at most one
//! pending request at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::leads::LeadStore;
use crate::leads::model::{HumanRequestKind, HumanRequestStatus, PendingHumanRequest};
use crate::notify::{DashboardEvent, Notifier};
use crate::pipeline::stages::Stage;
use crate::store::Database;

pub struct HumanGate {
    requests: RwLock<HashMap<String, PendingHumanRequest>>,
    leads: Arc<LeadStore>,
    notifier: Arc<Notifier>,
    db: Option<Arc<dyn Database>>,
    ttl: Option<Duration>,
}

impl HumanGate {
    pub fn new(leads: Arc<LeadStore>, notifier: Arc<Notifier>, ttl: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            requests: RwLock::new(HashMap::new()),
            leads,
            notifier,
            db: None,
            ttl,
        })
    }

    /// Create a gate backed by the `human_requests` table, rehydrating
    /// requests that were pending when the process stopped.
    pub async fn with_db(
        leads: Arc<LeadStore>,
        notifier: Arc<Notifier>,
        ttl: Option<Duration>,
        db: Arc<dyn Database>,
    ) -> Result<Arc<Self>, DatabaseError> {
        let requests: HashMap<_, _> = db
            .load_human_requests()
            .await?
            .into_iter()
            .map(|r| (r.request_id.clone(), r))
            .collect();
        info!(
            pending = requests.values().filter(|r| r.is_pending()).count(),
            "Human requests loaded from database"
        );
        Ok(Arc::new(Self {
            requests: RwLock::new(requests),
            leads,
            notifier,
            db: Some(db),
            ttl,
        }))
    }

    /// Park `lead_id` until a human answers `prompt`.
    pub async fn request(
        &self,
        lead_id: Uuid,
        stage: Stage,
        kind: HumanRequestKind,
        prompt: impl Into<String>,
    ) -> Result<PendingHumanRequest, PipelineError> {
        self.leads.get(lead_id).await?;

        let request = {
            let mut requests = self.requests.write().await;
            if let Some(existing) = requests
                .values()
                .find(|r| r.lead_id == lead_id && r.is_pending())
            {
                return Err(PipelineError::AlreadyPending {
                    lead_id,
                    request_id: existing.request_id.clone(),
                });
            }

            let now = Utc::now();
            let request = PendingHumanRequest {
                request_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
                lead_id,
                stage,
                kind,
                prompt: prompt.into(),
                status: HumanRequestStatus::Pending,
                response: None,
                created_at: now,
                expires_at: self
                    .ttl
                    .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                    .map(|ttl| now + ttl),
                resolved_at: None,
            };
            if let Some(db) = &self.db {
                db.upsert_human_request(&request).await?;
            }
            requests.insert(request.request_id.clone(), request.clone());
            request
        };

        info!(
            lead_id = %lead_id,
            request_id = %request.request_id,
            stage = %stage,
            "Human input requested"
        );
        self.notifier
            .publish(DashboardEvent::HumanInputRequest {
                lead_id,
                request: request.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(request)
    }

    /// Record the human's answer. Fails with `NotFound` if the request is
    /// unknown or no longer pending. A website mock-up answer must carry a URL.
    pub async fn resolve(
        &self,
        request_id: &str,
        response: impl Into<String>,
    ) -> Result<PendingHumanRequest, PipelineError> {
        let response = response.into();
        let mut requests = self.requests.write().await;
        let current = requests
            .get(request_id)
            .filter(|r| r.is_pending())
            .ok_or_else(|| PipelineError::request_not_found(request_id))?;
        if current.kind == HumanRequestKind::WebsiteMockup && response.trim().is_empty() {
            return Err(PipelineError::Validation(
                "a website mock-up request needs a URL".into(),
            ));
        }

        let mut resolved = current.clone();
        resolved.status = HumanRequestStatus::Resolved;
        resolved.response = Some(response);
        resolved.resolved_at = Some(Utc::now());

        if let Some(db) = &self.db {
            db.upsert_human_request(&resolved).await?;
        }
        requests.insert(request_id.to_string(), resolved.clone());
        info!(lead_id = %resolved.lead_id, request_id, "Human input resolved");
        Ok(resolved)
    }

    /// Withdraw a pending request without resuming the lead.
    pub async fn cancel(
        &self,
        request_id: &str,
        reason: &str,
    ) -> Result<PendingHumanRequest, PipelineError> {
        let cancelled = self
            .close(request_id, HumanRequestStatus::Cancelled)
            .await
            .ok_or_else(|| PipelineError::request_not_found(request_id))?;
        self.notifier
            .publish(DashboardEvent::HumanInputCancelled {
                lead_id: cancelled.lead_id,
                request_id: cancelled.request_id.clone(),
                message: reason.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(cancelled)
    }

    /// Expire every pending request whose deadline has passed.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<PendingHumanRequest> {
        let overdue: Vec<String> = {
            let requests = self.requests.read().await;
            requests
                .values()
                .filter(|r| r.is_overdue(now))
                .map(|r| r.request_id.clone())
                .collect()
        };

        let mut expired = Vec::new();
        for request_id in overdue {
            if let Some(request) = self.close(&request_id, HumanRequestStatus::Expired).await {
                info!(lead_id = %request.lead_id, request_id = %request_id, "Human request expired");
                self.notifier
                    .publish(DashboardEvent::HumanInputCancelled {
                        lead_id: request.lead_id,
                        request_id: request.request_id.clone(),
                        message: "Request expired without a response".to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
                expired.push(request);
            }
        }
        expired
    }

    async fn close(
        &self,
        request_id: &str,
        status: HumanRequestStatus,
    ) -> Option<PendingHumanRequest> {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(request_id).filter(|r| r.is_pending())?;
        request.status = status;
        request.resolved_at = Some(Utc::now());
        let closed = request.clone();

        if let Some(db) = &self.db
            && let Err(e) = db.upsert_human_request(&closed).await
        {
            warn!(request_id, error = %e, "Failed to persist human request status");
        }
        Some(closed)
    }

    /// Pending requests, oldest first.
    pub async fn list_pending(&self) -> Vec<PendingHumanRequest> {
        let requests = self.requests.read().await;
        let mut pending: Vec<_> = requests.values().filter(|r| r.is_pending()).cloned().collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub async fn pending_for_lead(&self, lead_id: Uuid) -> Option<PendingHumanRequest> {
        let requests = self.requests.read().await;
        requests
            .values()
            .find(|r| r.lead_id == lead_id && r.is_pending())
            .cloned()
    }

    pub async fn get(&self, request_id: &str) -> Option<PendingHumanRequest> {
        self.requests.read().await.get(request_id).cloned()
    }

    /// Cancel everything and forget it. Returns how many requests were pending.
    pub async fn reset(&self) -> Result<usize, PipelineError> {
        let mut requests = self.requests.write().await;
        let pending = requests.values().filter(|r| r.is_pending()).count();
        if let Some(db) = &self.db {
            db.clear_human_requests().await?;
        }
        requests.clear();
        info!(cancelled = pending, "Human gate reset");
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::PlaceCandidate;
    use crate::store::LibSqlBackend;

    async fn setup(ttl: Option<Duration>) -> (Arc<HumanGate>, Arc<LeadStore>, Uuid) {
        let leads = LeadStore::new();
        let (lead, _) = leads
            .create(
                PlaceCandidate {
                    place_id: "p1".into(),
                    name: "Joe's Tacos".into(),
                    address: "1 Main St".into(),
                    phone: None,
                    website: None,
                    rating: None,
                    review_count: None,
                },
                "Austin",
            )
            .await
            .unwrap();
        let gate = HumanGate::new(Arc::clone(&leads), Notifier::new(), ttl);
        (gate, leads, lead.id)
    }

    #[tokio::test]
    async fn at_most_one_pending_request_per_lead() {
        let (gate, _, lead_id) = setup(None).await;
        let first = gate
            .request(lead_id, Stage::OutreachEmail, HumanRequestKind::WebsiteMockup, "mock-up?")
            .await
            .unwrap();

        let err = gate
            .request(lead_id, Stage::OutreachEmail, HumanRequestKind::Approval, "again?")
            .await
            .unwrap_err();
        match err {
            PipelineError::AlreadyPending { request_id, .. } => {
                assert_eq!(request_id, first.request_id)
            }
            other => panic!("expected AlreadyPending, got {other:?}"),
        }

        let pending = gate.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prompt, "mock-up?");
    }

    #[tokio::test]
    async fn request_for_unknown_lead_is_not_found() {
        let (gate, _, _) = setup(None).await;
        let err = gate
            .request(Uuid::new_v4(), Stage::Research, HumanRequestKind::Approval, "?")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn blank_mockup_answer_keeps_request_pending() {
        let (gate, _, lead_id) = setup(None).await;
        let req = gate
            .request(lead_id, Stage::OutreachEmail, HumanRequestKind::WebsiteMockup, "url?")
            .await
            .unwrap();

        let err = gate.resolve(&req.request_id, "   ").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        let pending = gate.get(&req.request_id).await.unwrap();
        assert!(pending.is_pending());
        assert!(pending.response.is_none());
    }

    #[tokio::test]
    async fn resolve_frees_the_lead() {
        let (gate, _, lead_id) = setup(None).await;
        let req = gate
            .request(lead_id, Stage::OutreachEmail, HumanRequestKind::WebsiteMockup, "url?")
            .await
            .unwrap();

        let resolved = gate.resolve(&req.request_id, "https://mock.site").await.unwrap();
        assert_eq!(resolved.status, HumanRequestStatus::Resolved);
        assert_eq!(resolved.response.as_deref(), Some("https://mock.site"));
        assert!(gate.pending_for_lead(lead_id).await.is_none());

        // Resolving twice is NotFound.
        let err = gate.resolve(&req.request_id, "again").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));

        gate.request(lead_id, Stage::OutreachEmail, HumanRequestKind::Approval, "next")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolve_unknown_request_is_not_found() {
        let (gate, _, _) = setup(None).await;
        let err = gate.resolve("nope", "x").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { entity: "human request", .. }));
    }

    #[tokio::test]
    async fn overdue_requests_expire() {
        let (gate, _, lead_id) = setup(Some(Duration::from_secs(60))).await;
        let req = gate
            .request(lead_id, Stage::OutreachEmail, HumanRequestKind::Approval, "?")
            .await
            .unwrap();
        assert!(req.expires_at.is_some());

        assert!(gate.expire_overdue(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::minutes(2);
        let expired = gate.expire_overdue(later).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, HumanRequestStatus::Expired);
        assert!(gate.list_pending().await.is_empty());
        assert!(gate.resolve(&req.request_id, "late").await.is_err());
    }

    #[tokio::test]
    async fn no_ttl_never_expires() {
        let (gate, _, lead_id) = setup(None).await;
        gate.request(lead_id, Stage::OutreachEmail, HumanRequestKind::Approval, "?")
            .await
            .unwrap();
        let far = Utc::now() + chrono::Duration::days(365);
        assert!(gate.expire_overdue(far).await.is_empty());
        assert_eq!(gate.list_pending().await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_publishes_and_closes() {
        let (gate, _, lead_id) = setup(None).await;
        let mut rx = gate.notifier.subscribe();
        let req = gate
            .request(lead_id, Stage::OutreachEmail, HumanRequestKind::Approval, "?")
            .await
            .unwrap();
        gate.cancel(&req.request_id, "operator cancelled").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type(), "human_input_request");
        assert_eq!(rx.recv().await.unwrap().event_type(), "human_input_cancelled");
        assert!(gate.cancel(&req.request_id, "again").await.is_err());
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let (gate, _, lead_id) = setup(None).await;
        gate.request(lead_id, Stage::OutreachEmail, HumanRequestKind::Approval, "?")
            .await
            .unwrap();
        assert_eq!(gate.reset().await.unwrap(), 1);
        assert!(gate.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn pending_requests_survive_restart() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let leads = LeadStore::with_db(Arc::clone(&db)).await.unwrap();
        let (lead, _) = leads
            .create(
                PlaceCandidate {
                    place_id: "p9".into(),
                    name: "Bakery".into(),
                    address: "2 Elm".into(),
                    phone: None,
                    website: None,
                    rating: None,
                    review_count: None,
                },
                "Austin",
            )
            .await
            .unwrap();

        let gate = HumanGate::with_db(Arc::clone(&leads), Notifier::new(), None, Arc::clone(&db))
            .await
            .unwrap();
        let req = gate
            .request(lead.id, Stage::OutreachEmail, HumanRequestKind::WebsiteMockup, "url?")
            .await
            .unwrap();

        let reloaded = HumanGate::with_db(leads, Notifier::new(), None, db).await.unwrap();
        let pending = reloaded.pending_for_lead(lead.id).await.unwrap();
        assert_eq!(pending.request_id, req.request_id);
        assert_eq!(pending.kind, HumanRequestKind::WebsiteMockup);
    }
}
