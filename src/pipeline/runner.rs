//! Stage runner: executes one stage for one lead.
//!
//! The transition is checked before any work starts. External calls run under
//! the retry policy, and the lead is only promoted once every side effect has
//! succeeded. The commit goes through `LeadStore::update`, which re-checks the
//! transition under the per-lead lock.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::{RetryPolicy, call_with_retry};
use super::stages::{
    self, EffectResult, MeetingRequest, OutreachChannel, SideEffect, Stage, StageInput,
    StageOutcome,
};
use crate::classifier::{Classification, Intent, intent_transition};
use crate::config::PipelineConfig;
use crate::error::{ExternalError, PipelineError};
use crate::gate::HumanGate;
use crate::leads::{Lead, LeadStatus, LeadStore};
use crate::llm::{ChatMessage, CompletionRequest};
use crate::notify::{DashboardEvent, Notifier};
use crate::services::Services;

const RESEARCH_PROMPT: &str = "You research small local businesses for a web design agency. \
In one short paragraph, describe what the business does, who its customers are, how they \
currently find it without a website, and what a simple website could do for it. Plain text only.";

/// What the caller wants a stage to do.
#[derive(Debug, Clone)]
pub enum StageRequest {
    Research,
    Proposal,
    Outreach {
        channel: OutreachChannel,
        /// Overrides the lead's stored address for e-mail outreach.
        email: Option<String>,
    },
    Reply {
        classification: Classification,
    },
    Manual {
        stage: Stage,
        target: LeadStatus,
        reason: String,
    },
    Meeting {
        request: MeetingRequest,
    },
}

impl StageRequest {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Research => Stage::Research,
            Self::Proposal => Stage::Proposal,
            Self::Outreach { channel, .. } => channel.stage(),
            Self::Reply { .. } => Stage::Classification,
            Self::Manual { stage, .. } => *stage,
            Self::Meeting { .. } => Stage::MeetingScheduling,
        }
    }

    /// The status this request would move `lead` to, if any.
    pub fn intended_target(&self, lead: &Lead, threshold: f32) -> Option<LeadStatus> {
        match self {
            Self::Research => (lead.status == LeadStatus::Found).then_some(LeadStatus::Researched),
            Self::Proposal => None,
            Self::Outreach { .. } => Some(LeadStatus::Contacted),
            Self::Reply { classification } => {
                let actionable = !classification.low_confidence
                    && classification.confidence >= threshold
                    && classification.intent != Intent::Other;
                actionable
                    .then(|| intent_transition(lead.status, classification.intent))
                    .flatten()
            }
            Self::Manual { target, .. } => Some(*target),
            Self::Meeting { .. } => Some(LeadStatus::MeetingScheduled),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageResult {
    /// The stage committed. `status_before` equals `lead.status` when the
    /// stage changed nothing but notes or attachments.
    Completed {
        lead: Box<Lead>,
        status_before: LeadStatus,
    },
    /// The lead is parked on the human gate.
    Suspended { request_id: String },
}

impl StageResult {
    pub fn lead(&self) -> Option<&Lead> {
        match self {
            Self::Completed { lead, .. } => Some(lead),
            Self::Suspended { .. } => None,
        }
    }
}

pub struct StageRunner {
    leads: Arc<LeadStore>,
    notifier: Arc<Notifier>,
    gate: Arc<HumanGate>,
    services: Services,
    config: Arc<PipelineConfig>,
    policy: RetryPolicy,
}

impl StageRunner {
    pub fn new(
        leads: Arc<LeadStore>,
        notifier: Arc<Notifier>,
        gate: Arc<HumanGate>,
        services: Services,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            leads,
            notifier,
            gate,
            services,
            config,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `request` against `lead_id`. Failures are recorded on the lead and
    /// published before being returned.
    pub async fn run(
        &self,
        lead_id: Uuid,
        request: StageRequest,
    ) -> Result<StageResult, PipelineError> {
        let stage = request.stage();
        let lead = self.leads.get(lead_id).await?;

        if let Some(target) = request.intended_target(&lead, self.config.classifier_threshold)
            && !lead.status.can_transition_to(target)
        {
            return Err(self.reject_transition(&lead, target).await);
        }

        info!(lead_id = %lead_id, stage = %stage, status = %lead.status, "Stage started");
        self.notifier
            .publish(DashboardEvent::StageStarted {
                lead_id,
                stage,
                timestamp: Utc::now(),
            })
            .await;

        match self.execute(&lead, stage, request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.record_failure(lead_id, stage, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        lead: &Lead,
        stage: Stage,
        request: StageRequest,
    ) -> Result<StageResult, PipelineError> {
        let input = self.gather(lead, request).await?;
        let mut outcome = stages::plan(lead, input, &self.config)?;

        let effects = std::mem::take(&mut outcome.side_effects);
        for effect in &effects {
            if let SideEffect::RequestHumanInput { kind, prompt } = effect {
                let request = self.gate.request(lead.id, stage, *kind, prompt.clone()).await?;
                let notes = std::mem::take(&mut outcome.notes);
                let attachments = std::mem::take(&mut outcome.attachments);
                let parked = self
                    .leads
                    .update(lead.id, |l| {
                        for note in notes {
                            l.add_note(stage.as_str(), note);
                        }
                        attachments.apply(l);
                        Ok(())
                    })
                    .await;
                if let Err(e) = parked {
                    // Leave no request behind for a lead that could not be parked.
                    if let Err(cancel_err) = self
                        .gate
                        .cancel(&request.request_id, "Lead could not be parked")
                        .await
                    {
                        debug!(
                            request_id = %request.request_id,
                            error = %cancel_err,
                            "Human request already closed"
                        );
                    }
                    return Err(e);
                }
                return Ok(StageResult::Suspended {
                    request_id: request.request_id,
                });
            }

            let result = self.perform(effect).await?;
            outcome.absorb(effect, result)?;
        }

        self.commit(lead, stage, outcome).await
    }

    /// Collect whatever the stage needs from collaborators before planning.
    async fn gather(&self, lead: &Lead, request: StageRequest) -> Result<StageInput, PipelineError> {
        Ok(match request {
            StageRequest::Research => {
                let report = self
                    .complete_with_retry(vec![
                        ChatMessage::system(RESEARCH_PROMPT),
                        ChatMessage::user(describe_lead(lead)),
                    ])
                    .await?;
                StageInput::Research { report }
            }
            StageRequest::Proposal => {
                let research = lead.research.as_ref().ok_or_else(|| {
                    PipelineError::Validation(
                        "research is required before drafting a proposal".into(),
                    )
                })?;
                let draft = self
                    .complete_with_retry(vec![
                        ChatMessage::system(format!(
                            "You write short, friendly cold e-mails offering a website to a \
                             local business. Plain text, no subject line, under 150 words. \
                             Sign off as {}.",
                            self.config.sender_name
                        )),
                        ChatMessage::user(format!(
                            "{}\n\nResearch:\n{}",
                            describe_lead(lead),
                            research.summary
                        )),
                    ])
                    .await?;
                StageInput::Proposal { draft }
            }
            StageRequest::Outreach {
                channel: OutreachChannel::Email,
                email,
            } => StageInput::OutreachEmail { to: email },
            StageRequest::Outreach {
                channel: OutreachChannel::Call,
                ..
            } => StageInput::OutreachCall,
            StageRequest::Reply { classification } => StageInput::Reply { classification },
            StageRequest::Manual { target, reason, .. } => StageInput::Manual { target, reason },
            StageRequest::Meeting { request } => StageInput::Meeting { request },
        })
    }

    async fn complete_with_retry(&self, messages: Vec<ChatMessage>) -> Result<String, ExternalError> {
        let llm = Arc::clone(self.services.llm()?);
        let request = CompletionRequest::new(messages)
            .with_temperature(0.4)
            .with_max_tokens(1024);

        call_with_retry(&self.policy, "llm", || {
            let llm = Arc::clone(&llm);
            let request = request.clone();
            async move {
                let content = llm.complete(request).await.map_err(ExternalError::from)?.content;
                // An empty answer is worth another attempt.
                if content.trim().is_empty() {
                    return Err(ExternalError::invalid("llm", "empty completion"));
                }
                Ok(content)
            }
        })
        .await
    }

    async fn perform(&self, effect: &SideEffect) -> Result<EffectResult, ExternalError> {
        match effect {
            SideEffect::SendEmail(email) => {
                let mailer = Arc::clone(self.services.mailer()?);
                let sent = call_with_retry(&self.policy, "smtp", || {
                    let mailer = Arc::clone(&mailer);
                    let email = email.clone();
                    async move { mailer.send(&email).await }
                })
                .await?;
                Ok(EffectResult::EmailSent {
                    message_id: sent.message_id,
                })
            }
            SideEffect::PlaceCall {
                number,
                script_context,
            } => {
                let voice = Arc::clone(self.services.voice()?);
                let outcome = call_with_retry(&self.policy, "voice", || {
                    let voice = Arc::clone(&voice);
                    let number = number.clone();
                    let script_context = script_context.clone();
                    async move {
                        let outcome = voice.place_call(&number, &script_context).await?;
                        if !outcome.is_connected() {
                            return Err(ExternalError::failed(
                                "voice",
                                format!("call to {number} did not connect"),
                            ));
                        }
                        Ok(outcome)
                    }
                })
                .await?;
                Ok(EffectResult::CallPlaced(outcome))
            }
            SideEffect::CreateEvent(request) => {
                let calendar = Arc::clone(self.services.calendar()?);
                let event = call_with_retry(&self.policy, "calendar", || {
                    let calendar = Arc::clone(&calendar);
                    let request = request.clone();
                    async move { calendar.create_event(&request).await }
                })
                .await?;
                Ok(EffectResult::EventCreated(event))
            }
            SideEffect::RequestHumanInput { .. } => Err(ExternalError::invalid(
                "human_gate",
                "human input is not an external call",
            )),
        }
    }

    async fn commit(
        &self,
        lead: &Lead,
        stage: Stage,
        outcome: StageOutcome,
    ) -> Result<StageResult, PipelineError> {
        let StageOutcome {
            new_status,
            notes,
            attachments,
            ..
        } = outcome;
        let message = notes
            .last()
            .cloned()
            .unwrap_or_else(|| format!("{stage} completed"));

        let committed = self
            .leads
            .update(lead.id, move |l| {
                let before = l.status;
                if let Some(target) = new_status {
                    l.transition_to(target)
                        .map_err(|from| PipelineError::InvalidTransition {
                            lead_id: l.id,
                            from,
                            to: target,
                        })?;
                }
                for note in notes {
                    l.add_note(stage.as_str(), note);
                }
                attachments.apply(l);
                Ok(before)
            })
            .await;

        let (updated, status_before) = match committed {
            Ok(committed) => committed,
            Err(PipelineError::InvalidTransition { to, .. }) => {
                // Lost a race with another stage on the same lead.
                let current = self.leads.get(lead.id).await?;
                return Err(self.reject_transition(&current, to).await);
            }
            Err(e) => return Err(e),
        };

        info!(
            lead_id = %updated.id,
            stage = %stage,
            from = %status_before,
            to = %updated.status,
            "Stage committed"
        );
        self.notifier
            .publish(DashboardEvent::LeadUpdated {
                lead_id: updated.id,
                business: updated.clone(),
                status_before,
                status_after: updated.status,
                message,
                timestamp: Utc::now(),
            })
            .await;

        if stage == Stage::MeetingScheduling
            && let Some(meeting) = &updated.meeting
        {
            self.notifier
                .publish(DashboardEvent::MeetingScheduled {
                    lead_id: updated.id,
                    meeting: meeting.clone(),
                    timestamp: Utc::now(),
                })
                .await;
        }

        Ok(StageResult::Completed {
            lead: Box::new(updated),
            status_before,
        })
    }

    async fn reject_transition(&self, lead: &Lead, target: LeadStatus) -> PipelineError {
        warn!(
            lead_id = %lead.id,
            from = %lead.status,
            to = %target,
            "Transition rejected"
        );
        self.notifier
            .publish(DashboardEvent::TransitionRejected {
                lead_id: lead.id,
                status_before: lead.status,
                attempted: target,
                message: format!("Cannot move {} from {} to {}", lead.name, lead.status, target),
                timestamp: Utc::now(),
            })
            .await;
        PipelineError::InvalidTransition {
            lead_id: lead.id,
            from: lead.status,
            to: target,
        }
    }

    async fn record_failure(&self, lead_id: Uuid, stage: Stage, err: &PipelineError) {
        match err {
            // Already published by reject_transition.
            PipelineError::InvalidTransition { .. } => return,
            PipelineError::NotFound { .. } => {
                warn!(lead_id = %lead_id, stage = %stage, "Lead vanished mid-stage, dropping result");
            }
            PipelineError::External(e) => {
                error!(lead_id = %lead_id, stage = %stage, error = %e, "Stage failed");
                let note = format!("stage_failed: {e}");
                if let Err(e) = self
                    .leads
                    .update(lead_id, |l| {
                        l.add_note(stage.as_str(), note);
                        Ok(())
                    })
                    .await
                {
                    warn!(lead_id = %lead_id, error = %e, "Could not record stage failure note");
                }
            }
            other => {
                warn!(lead_id = %lead_id, stage = %stage, error = %other, "Stage aborted");
            }
        }

        self.notifier
            .publish(DashboardEvent::StageFailed {
                lead_id,
                stage,
                message: err.to_string(),
                timestamp: Utc::now(),
            })
            .await;
    }
}

fn describe_lead(lead: &Lead) -> String {
    let mut out = format!("Business: {}\nAddress: {}\nCity: {}", lead.name, lead.address, lead.city);
    if let Some(rating) = lead.rating {
        out.push_str(&format!("\nRating: {rating:.1}"));
    }
    if let Some(reviews) = lead.review_count {
        out.push_str(&format!(" ({reviews} reviews)"));
    }
    if let Some(phone) = &lead.phone {
        out.push_str(&format!("\nPhone: {phone}"));
    }
    out
}
