//! Lead pipeline: stage runner plus the operations the dashboard and the
//! mail channel drive.
//!
//! `Pipeline` owns the shared state (lead store, notifier, human gate) and
//! routes every status change through the `StageRunner`, so manual updates
//! get the same validation, notes and events as automated stages.

pub mod discovery;
pub mod inbound;
pub mod retry;
pub mod runner;
pub mod stages;
pub mod sweep;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub use discovery::{DiscoveryReport, DiscoveryStatus};
pub use inbound::InboundOutcome;
pub use retry::{RetryPolicy, call_with_retry};
pub use runner::{StageRequest, StageResult, StageRunner};
pub use stages::{MeetingRequest, OutreachChannel, Stage};

use crate::classifier::{Classification, ReplyClassifier};
use crate::config::PipelineConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::gate::HumanGate;
use crate::leads::model::{HumanRequestKind, PendingHumanRequest};
use crate::leads::{Lead, LeadStatus, LeadStore};
use crate::notify::{DashboardEvent, Notifier};
use crate::services::Services;
use crate::store::Database;

use inbound::SeenMessages;

/// Status report posted by an external agent process.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentUpdate {
    pub agent_type: String,
    pub lead_id: Uuid,
    /// `None` records the message as a note without a status change.
    #[serde(default)]
    pub status: Option<LeadStatus>,
    #[serde(default)]
    pub message: String,
}

/// Summary for `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub is_running: bool,
    pub current_city: Option<String>,
    pub lead_count: usize,
    pub pending_requests: usize,
}

pub struct Pipeline {
    leads: Arc<LeadStore>,
    notifier: Arc<Notifier>,
    gate: Arc<HumanGate>,
    runner: StageRunner,
    classifier: ReplyClassifier,
    services: Services,
    config: Arc<PipelineConfig>,
    discovery: Arc<Mutex<DiscoveryStatus>>,
    seen: Mutex<SeenMessages>,
}

impl Pipeline {
    /// Wire a pipeline around existing shared state.
    pub fn new(
        leads: Arc<LeadStore>,
        notifier: Arc<Notifier>,
        gate: Arc<HumanGate>,
        services: Services,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let runner = StageRunner::new(
            Arc::clone(&leads),
            Arc::clone(&notifier),
            Arc::clone(&gate),
            services.clone(),
            Arc::clone(&config),
        );
        let classifier = ReplyClassifier::new(
            services.classifier_llm(),
            config.classifier_threshold,
            config.call_timeout,
        );
        Arc::new(Self {
            leads,
            notifier,
            gate,
            runner,
            classifier,
            services,
            config,
            discovery: Arc::new(Mutex::new(DiscoveryStatus::default())),
            seen: Mutex::new(SeenMessages::default()),
        })
    }

    /// Build the shared state, loading it from `db` when given.
    pub async fn open(
        db: Option<Arc<dyn Database>>,
        services: Services,
        config: PipelineConfig,
    ) -> Result<Arc<Self>, DatabaseError> {
        let ttl = config.human_request_ttl;
        let (leads, notifier, gate) = match db {
            Some(db) => {
                let leads = LeadStore::with_db(Arc::clone(&db)).await?;
                let notifier = Notifier::with_db(Arc::clone(&db)).await;
                let gate =
                    HumanGate::with_db(Arc::clone(&leads), Arc::clone(&notifier), ttl, db).await?;
                (leads, notifier, gate)
            }
            None => {
                let leads = LeadStore::new();
                let notifier = Notifier::new();
                let gate = HumanGate::new(Arc::clone(&leads), Arc::clone(&notifier), ttl);
                (leads, notifier, gate)
            }
        };
        Ok(Self::new(leads, notifier, gate, services, config))
    }

    pub fn leads(&self) -> &Arc<LeadStore> {
        &self.leads
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn gate(&self) -> &Arc<HumanGate> {
        &self.gate
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn get_lead(&self, id: Uuid) -> Result<Lead, PipelineError> {
        self.leads.get(id).await
    }

    // ── Stages ──────────────────────────────────────────────────────

    pub async fn research(&self, id: Uuid) -> Result<StageResult, PipelineError> {
        self.runner.run(id, StageRequest::Research).await
    }

    pub async fn proposal(&self, id: Uuid) -> Result<StageResult, PipelineError> {
        self.runner.run(id, StageRequest::Proposal).await
    }

    pub async fn outreach(
        &self,
        id: Uuid,
        channel: OutreachChannel,
        email: Option<String>,
    ) -> Result<StageResult, PipelineError> {
        self.runner
            .run(id, StageRequest::Outreach { channel, email })
            .await
    }

    pub async fn schedule_meeting(
        &self,
        id: Uuid,
        request: MeetingRequest,
    ) -> Result<Lead, PipelineError> {
        let result = self.runner.run(id, StageRequest::Meeting { request }).await?;
        self.settle(id, result).await
    }

    /// Apply a classification supplied by an operator instead of the classifier.
    pub async fn submit_classification(
        &self,
        id: Uuid,
        classification: Classification,
    ) -> Result<Lead, PipelineError> {
        let result = self
            .runner
            .run(id, StageRequest::Reply { classification })
            .await?;
        self.settle(id, result).await
    }

    // ── Manual status changes ───────────────────────────────────────

    pub async fn mark_converting(&self, id: Uuid) -> Result<Lead, PipelineError> {
        self.manual(id, Stage::Conversion, LeadStatus::Converting, "Marked as hot lead")
            .await
    }

    pub async fn confirm(&self, id: Uuid) -> Result<Lead, PipelineError> {
        self.manual(id, Stage::Confirmation, LeadStatus::Confirmed, "Confirmed")
            .await
    }

    pub async fn reject(&self, id: Uuid) -> Result<Lead, PipelineError> {
        self.manual(id, Stage::Rejection, LeadStatus::Rejected, "Declined")
            .await
    }

    pub async fn mark_no_response(&self, id: Uuid) -> Result<Lead, PipelineError> {
        self.manual(
            id,
            Stage::NoResponse,
            LeadStatus::NoResponse,
            "No reply within the follow-up window",
        )
        .await
    }

    /// Append a manual note without changing status.
    pub async fn add_note(&self, id: Uuid, text: &str) -> Result<Lead, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Validation("note text must not be empty".into()));
        }
        let (lead, ()) = self
            .leads
            .update(id, |l| {
                l.add_note(Stage::Manual.as_str(), text);
                Ok(())
            })
            .await?;
        self.publish_unchanged(&lead, text.to_string()).await;
        Ok(lead)
    }

    /// Record a status report from an external agent. A status change is
    /// validated against the state machine like any other stage.
    pub async fn apply_agent_update(&self, update: AgentUpdate) -> Result<Lead, PipelineError> {
        let message = if update.message.trim().is_empty() {
            format!("{} agent reported", update.agent_type)
        } else {
            format!("{} agent: {}", update.agent_type, update.message.trim())
        };

        match update.status {
            Some(target) => {
                let result = self
                    .runner
                    .run(
                        update.lead_id,
                        StageRequest::Manual {
                            stage: Stage::AgentCallback,
                            target,
                            reason: message,
                        },
                    )
                    .await?;
                self.settle(update.lead_id, result).await
            }
            None => {
                let (lead, ()) = self
                    .leads
                    .update(update.lead_id, |l| {
                        l.add_note(Stage::AgentCallback.as_str(), message.clone());
                        Ok(())
                    })
                    .await?;
                self.publish_unchanged(&lead, message).await;
                Ok(lead)
            }
        }
    }

    async fn manual(
        &self,
        id: Uuid,
        stage: Stage,
        target: LeadStatus,
        reason: &str,
    ) -> Result<Lead, PipelineError> {
        let result = self
            .runner
            .run(
                id,
                StageRequest::Manual {
                    stage,
                    target,
                    reason: reason.to_string(),
                },
            )
            .await?;
        self.settle(id, result).await
    }

    async fn settle(&self, id: Uuid, result: StageResult) -> Result<Lead, PipelineError> {
        match result {
            StageResult::Completed { lead, .. } => Ok(*lead),
            StageResult::Suspended { .. } => self.leads.get(id).await,
        }
    }

    async fn publish_unchanged(&self, lead: &Lead, message: String) {
        self.notifier
            .publish(DashboardEvent::LeadUpdated {
                lead_id: lead.id,
                business: lead.clone(),
                status_before: lead.status,
                status_after: lead.status,
                message,
                timestamp: Utc::now(),
            })
            .await;
    }

    // ── Human gate ──────────────────────────────────────────────────

    /// Ask an operator for input on a lead outside of any stage.
    pub async fn request_human_input(
        &self,
        lead_id: Uuid,
        kind: HumanRequestKind,
        prompt: &str,
    ) -> Result<PendingHumanRequest, PipelineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::Validation("prompt must not be empty".into()));
        }
        self.gate.request(lead_id, Stage::Manual, kind, prompt).await
    }

    /// Resolve a pending request, apply the answer to the lead and resume the
    /// stage that asked for it.
    pub async fn resolve_human_input(
        &self,
        request_id: &str,
        response: &str,
    ) -> Result<Lead, PipelineError> {
        let response = response.trim();
        let resolved = self.gate.resolve(request_id, response).await?;
        let stage = resolved.stage;
        let note = match resolved.kind {
            HumanRequestKind::WebsiteMockup => format!("Website mock-up ready: {response}"),
            HumanRequestKind::Approval => format!("Human response: {response}"),
        };

        let (lead, ()) = self
            .leads
            .update(resolved.lead_id, |l| {
                if resolved.kind == HumanRequestKind::WebsiteMockup {
                    l.website_url = Some(response.to_string());
                }
                l.add_note(stage.as_str(), note.clone());
                Ok(())
            })
            .await?;

        self.notifier
            .publish(DashboardEvent::HumanInputResolved {
                lead_id: lead.id,
                request_id: resolved.request_id.clone(),
                timestamp: Utc::now(),
            })
            .await;
        self.publish_unchanged(&lead, note).await;

        if let Some(request) = resume_request(stage) {
            info!(lead_id = %lead.id, stage = %stage, "Resuming stage after human input");
            if let Err(e) = self.runner.run(lead.id, request).await {
                warn!(lead_id = %lead.id, stage = %stage, error = %e, "Resumed stage failed");
            }
        }

        self.leads.get(lead.id).await
    }

    /// Withdraw a pending request. The lead keeps its status and becomes free
    /// for a new request; nothing is resumed.
    pub async fn cancel_human_input(
        &self,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<PendingHumanRequest, PipelineError> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("Cancelled by operator");
        self.gate.cancel(request_id, reason).await
    }

    // ── Dashboard ───────────────────────────────────────────────────

    pub fn discovery_status(&self) -> DiscoveryStatus {
        self.discovery
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub async fn status(&self) -> PipelineStatus {
        let discovery = self.discovery_status();
        PipelineStatus {
            is_running: discovery.is_running,
            current_city: discovery.current_city,
            lead_count: self.leads.len().await,
            pending_requests: self.gate.list_pending().await.len(),
        }
    }

    /// Full snapshot sent to a dashboard client on connect or after lag.
    pub async fn initial_state(&self) -> DashboardEvent {
        let discovery = self.discovery_status();
        DashboardEvent::InitialState {
            leads: self.leads.snapshot().await,
            pending_requests: self.gate.list_pending().await,
            activity: self.notifier.recent_activity().await,
            current_city: discovery.current_city,
            is_running: discovery.is_running,
            timestamp: Utc::now(),
        }
    }

    /// Clear leads and pending requests. In-flight stages are not cancelled;
    /// their commits fail with `NotFound`.
    pub async fn reset(&self) -> Result<usize, PipelineError> {
        let cleared_leads = self.leads.reset().await?;
        let cleared_requests = self.gate.reset().await?;
        if let Ok(mut seen) = self.seen.lock() {
            seen.clear();
        }
        info!(cleared_leads, cleared_requests, "Pipeline reset");
        self.notifier
            .publish(DashboardEvent::StateReset {
                message: format!(
                    "Cleared {cleared_leads} leads and {cleared_requests} human requests"
                ),
                timestamp: Utc::now(),
            })
            .await;
        Ok(cleared_leads)
    }
}

/// The stage to re-enter when a request raised by `stage` is resolved.
fn resume_request(stage: Stage) -> Option<StageRequest> {
    match stage {
        Stage::Research => Some(StageRequest::Research),
        Stage::Proposal => Some(StageRequest::Proposal),
        Stage::OutreachEmail => Some(StageRequest::Outreach {
            channel: OutreachChannel::Email,
            email: None,
        }),
        Stage::OutreachCall => Some(StageRequest::Outreach {
            channel: OutreachChannel::Call,
            email: None,
        }),
        _ => None,
    }
}
