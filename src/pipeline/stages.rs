//! Stage definitions and their pure decision step.
//!
//! `plan` looks at a lead plus whatever the stage gathered (an LLM report, a
//! classification, a meeting request) and decides what should happen: the
//! target status, notes, side effects to run and data to attach. It performs
//! no I/O. The runner executes the side effects and commits the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::OutboundEmail;
use crate::classifier::{Classification, Intent, intent_transition};
use crate::config::PipelineConfig;
use crate::error::{ExternalError, PipelineError};
use crate::leads::model::{HumanRequestKind, Lead, LeadStatus, Meeting, Proposal, Research};
use crate::services::{CalendarEvent, CalendarEventRequest, CallOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Research,
    Proposal,
    OutreachEmail,
    OutreachCall,
    Classification,
    Conversion,
    Confirmation,
    Rejection,
    NoResponse,
    MeetingScheduling,
    AgentCallback,
    Manual,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Research => "research",
            Self::Proposal => "proposal",
            Self::OutreachEmail => "outreach_email",
            Self::OutreachCall => "outreach_call",
            Self::Classification => "classification",
            Self::Conversion => "conversion",
            Self::Confirmation => "confirmation",
            Self::Rejection => "rejection",
            Self::NoResponse => "no_response",
            Self::MeetingScheduling => "meeting_scheduling",
            Self::AgentCallback => "agent_callback",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachChannel {
    Email,
    Call,
}

impl OutreachChannel {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Email => Stage::OutreachEmail,
            Self::Call => Stage::OutreachCall,
        }
    }
}

/// A request to book a meeting with a confirmed lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub attendee_email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Data gathered by the runner before planning.
#[derive(Debug, Clone)]
pub enum StageInput {
    Research { report: String },
    Proposal { draft: String },
    OutreachEmail { to: Option<String> },
    OutreachCall,
    Reply { classification: Classification },
    Manual { target: LeadStatus, reason: String },
    Meeting { request: MeetingRequest },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    SendEmail(OutboundEmail),
    PlaceCall {
        number: String,
        script_context: String,
    },
    CreateEvent(CalendarEventRequest),
    RequestHumanInput {
        kind: HumanRequestKind,
        prompt: String,
    },
}

impl SideEffect {
    pub fn service(&self) -> &'static str {
        match self {
            Self::SendEmail(_) => "smtp",
            Self::PlaceCall { .. } => "voice",
            Self::CreateEvent(_) => "calendar",
            Self::RequestHumanInput { .. } => "human_gate",
        }
    }
}

/// What an executed side effect reported back.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectResult {
    EmailSent { message_id: String },
    CallPlaced(CallOutcome),
    EventCreated(CalendarEvent),
}

/// Data written to the lead on commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachments {
    pub research: Option<Research>,
    pub proposal: Option<Proposal>,
    pub meeting: Option<Meeting>,
    pub email: Option<String>,
    pub website_url: Option<String>,
}

impl Attachments {
    pub fn apply(self, lead: &mut Lead) {
        if let Some(research) = self.research {
            lead.research = Some(research);
        }
        if let Some(proposal) = self.proposal {
            lead.proposal = Some(proposal);
        }
        if let Some(meeting) = self.meeting {
            lead.meeting = Some(meeting);
        }
        if let Some(email) = self.email {
            lead.email = Some(email);
        }
        if let Some(url) = self.website_url {
            lead.website_url = Some(url);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    pub new_status: Option<LeadStatus>,
    pub notes: Vec<String>,
    pub side_effects: Vec<SideEffect>,
    pub attachments: Attachments,
}

impl StageOutcome {
    fn note(mut self, text: impl Into<String>) -> Self {
        self.notes.push(text.into());
        self
    }

    /// True when the stage parks the lead on the human gate.
    pub fn awaits_human(&self) -> bool {
        self.side_effects
            .iter()
            .any(|e| matches!(e, SideEffect::RequestHumanInput { .. }))
    }

    /// Fold a side-effect result into the outcome. Can turn a reported
    /// failure (e.g. a dropped call) into an error so the runner retries.
    pub fn absorb(&mut self, effect: &SideEffect, result: EffectResult) -> Result<(), ExternalError> {
        match (effect, result) {
            (SideEffect::SendEmail(email), EffectResult::EmailSent { message_id }) => {
                self.notes
                    .push(format!("Outreach e-mail sent to {} ({message_id})", email.to));
            }
            (SideEffect::PlaceCall { number, .. }, EffectResult::CallPlaced(call)) => {
                if !call.is_connected() {
                    return Err(ExternalError::failed(
                        "voice",
                        format!("call to {number} did not connect"),
                    ));
                }
                self.notes.push(format!("Call to {number}: {}", call.outcome));
                if call.outcome == "not_interested" {
                    self.notes
                        .push("Prospect declined on the phone, no follow-up planned".into());
                }
                if let Some(email) = call.captured_email.filter(|e| e.contains('@')) {
                    self.notes.push(format!("E-mail captured during call: {email}"));
                    self.attachments.email = Some(email);
                }
            }
            (SideEffect::CreateEvent(request), EffectResult::EventCreated(event)) => {
                self.notes.push(format!(
                    "Meeting '{}' booked for {}",
                    request.title,
                    request.start.to_rfc3339()
                ));
                self.attachments.meeting = Some(Meeting {
                    event_id: event.event_id,
                    title: request.title.clone(),
                    start: request.start,
                    end: request.end,
                    attendees: request.attendees.clone(),
                    location_link: event.join_link,
                });
            }
            (effect, result) => {
                return Err(ExternalError::invalid(
                    effect.service(),
                    format!("unexpected result {result:?}"),
                ));
            }
        }
        Ok(())
    }
}

/// Decide what a stage does to `lead`.
pub fn plan(
    lead: &Lead,
    input: StageInput,
    config: &PipelineConfig,
) -> Result<StageOutcome, PipelineError> {
    match input {
        StageInput::Research { report } => plan_research(lead, report),
        StageInput::Proposal { draft } => plan_proposal(lead, draft),
        StageInput::OutreachEmail { to } => plan_outreach_email(lead, to, config),
        StageInput::OutreachCall => plan_outreach_call(lead),
        StageInput::Reply { classification } => Ok(plan_reply(lead, &classification, config)),
        StageInput::Manual { target, reason } => Ok(StageOutcome {
            new_status: Some(target),
            ..Default::default()
        }
        .note(reason)),
        StageInput::Meeting { request } => plan_meeting(lead, request, config),
    }
}

/// Only a `found` lead is promoted. A re-run replaces the report in place.
fn plan_research(lead: &Lead, report: String) -> Result<StageOutcome, PipelineError> {
    let report = report.trim().to_string();
    if report.is_empty() {
        return Err(PipelineError::Validation("research report is empty".into()));
    }
    let first_run = lead.status == LeadStatus::Found;
    Ok(StageOutcome {
        new_status: first_run.then_some(LeadStatus::Researched),
        attachments: Attachments {
            research: Some(Research {
                summary: report,
                produced_at: Utc::now(),
            }),
            ..Default::default()
        },
        ..Default::default()
    }
    .note(if first_run {
        "Research completed"
    } else {
        "Research refreshed"
    }))
}

fn plan_proposal(lead: &Lead, draft: String) -> Result<StageOutcome, PipelineError> {
    if lead.research.is_none() {
        return Err(PipelineError::Validation(
            "research is required before drafting a proposal".into(),
        ));
    }
    let draft = draft.trim().to_string();
    if draft.is_empty() {
        return Err(PipelineError::Validation("proposal draft is empty".into()));
    }
    Ok(StageOutcome {
        attachments: Attachments {
            proposal: Some(Proposal {
                body: draft,
                produced_at: Utc::now(),
            }),
            ..Default::default()
        },
        ..Default::default()
    }
    .note("Proposal drafted"))
}

fn plan_outreach_email(
    lead: &Lead,
    to: Option<String>,
    config: &PipelineConfig,
) -> Result<StageOutcome, PipelineError> {
    let to = to
        .filter(|t| !t.trim().is_empty())
        .or_else(|| lead.email.clone())
        .ok_or_else(|| PipelineError::Validation(format!("lead {} has no e-mail address", lead.id)))?;

    if config.require_website_mockup && lead.website_url.is_none() {
        return Ok(StageOutcome {
            side_effects: vec![SideEffect::RequestHumanInput {
                kind: HumanRequestKind::WebsiteMockup,
                prompt: format!(
                    "Build a website mock-up for {} ({}) and reply with its URL",
                    lead.name, lead.address
                ),
            }],
            attachments: Attachments {
                email: lead.email.is_none().then_some(to),
                ..Default::default()
            },
            ..Default::default()
        }
        .note("Waiting for a website mock-up before outreach"));
    }

    let email = OutboundEmail {
        subject: outreach_subject(lead),
        body: outreach_body(lead, &config.sender_name),
        to: to.clone(),
    };

    Ok(StageOutcome {
        new_status: Some(LeadStatus::Contacted),
        side_effects: vec![SideEffect::SendEmail(email)],
        attachments: Attachments {
            email: lead.email.is_none().then_some(to),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub fn outreach_subject(lead: &Lead) -> String {
    format!("A website for {} [Ref: {}]", lead.name, lead.reference_code)
}

pub fn outreach_body(lead: &Lead, sender_name: &str) -> String {
    let mut body = match &lead.proposal {
        Some(proposal) => proposal.body.clone(),
        None => format!(
            "Hi {},\n\nWe noticed {} doesn't have a website yet. We build simple, \
             fast sites for local businesses and would love to show you what one \
             could look like for you.",
            lead.name, lead.name
        ),
    };
    if let Some(url) = &lead.website_url {
        body.push_str(&format!("\n\nHere is a preview we put together: {url}"));
    }
    body.push_str(&format!(
        "\n\nJust reply to this e-mail if you're interested.\n\n{sender_name}\n\nReference: {}",
        lead.reference_code
    ));
    body
}

fn plan_outreach_call(lead: &Lead) -> Result<StageOutcome, PipelineError> {
    let number = lead
        .phone
        .clone()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| PipelineError::Validation(format!("lead {} has no phone number", lead.id)))?;

    let mut script_context = format!("Business: {}\nAddress: {}", lead.name, lead.address);
    if let Some(research) = &lead.research {
        script_context.push_str(&format!("\nResearch: {}", research.summary));
    }
    if let Some(proposal) = &lead.proposal {
        script_context.push_str(&format!("\nProposal: {}", proposal.body));
    }

    Ok(StageOutcome {
        new_status: Some(LeadStatus::Contacted),
        side_effects: vec![SideEffect::PlaceCall {
            number,
            script_context,
        }],
        ..Default::default()
    })
}

/// Map a classified reply onto the lead. Low-confidence and unmapped
/// results only leave a note.
pub fn plan_reply(
    lead: &Lead,
    classification: &Classification,
    config: &PipelineConfig,
) -> StageOutcome {
    let below_threshold = classification.confidence < config.classifier_threshold;
    if classification.low_confidence || below_threshold || classification.intent == Intent::Other {
        return StageOutcome::default().note(format!(
            "Reply classified as {} ({:.2}), no status change",
            classification.raw_intent, classification.confidence
        ));
    }

    match intent_transition(lead.status, classification.intent) {
        Some(target) => StageOutcome {
            new_status: Some(target),
            ..Default::default()
        }
        .note(format!(
            "Reply classified as {} ({:.2})",
            classification.intent, classification.confidence
        )),
        None => StageOutcome::default().note(format!(
            "Reply classified as {} but lead is {}, no status change",
            classification.intent, lead.status
        )),
    }
}

fn plan_meeting(
    lead: &Lead,
    request: MeetingRequest,
    config: &PipelineConfig,
) -> Result<StageOutcome, PipelineError> {
    let minutes = request.duration_minutes.unwrap_or(config.meeting_minutes).max(1);
    let end = request
        .end
        .filter(|end| *end > request.start)
        .unwrap_or_else(|| request.start + chrono::Duration::minutes(i64::from(minutes)));

    let attendees: Vec<String> = request
        .attendee_email
        .or_else(|| lead.email.clone())
        .into_iter()
        .collect();

    let title = request
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("Website discussion with {}", lead.name));

    Ok(StageOutcome {
        new_status: Some(LeadStatus::MeetingScheduled),
        side_effects: vec![SideEffect::CreateEvent(CalendarEventRequest {
            title,
            description: request.description,
            start: request.start,
            end,
            attendees,
        })],
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassificationSource;
    use crate::leads::PlaceCandidate;

    fn lead() -> Lead {
        let mut lead = Lead::from_candidate(
            PlaceCandidate {
                place_id: "p1".into(),
                name: "Joe's Tacos".into(),
                address: "1 Main St".into(),
                phone: Some("+15125550100".into()),
                website: None,
                rating: Some(4.5),
                review_count: Some(120),
            },
            "Austin",
        );
        lead.email = Some("joe@joestacos.com".into());
        lead
    }

    fn at_status(status: LeadStatus) -> Lead {
        let mut lead = lead();
        lead.status = status;
        lead
    }

    #[test]
    fn research_sets_report_and_status() {
        let out = plan(
            &lead(),
            StageInput::Research {
                report: "  Family taqueria, 120 reviews.  ".into(),
            },
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(out.new_status, Some(LeadStatus::Researched));
        assert_eq!(
            out.attachments.research.unwrap().summary,
            "Family taqueria, 120 reviews."
        );
        assert!(out.side_effects.is_empty());
    }

    #[test]
    fn research_rerun_keeps_status() {
        let lead = at_status(LeadStatus::Contacted);
        let out = plan(
            &lead,
            StageInput::Research {
                report: "Now also does catering.".into(),
            },
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(out.new_status, None);
        assert_eq!(
            out.attachments.research.unwrap().summary,
            "Now also does catering."
        );
        assert_eq!(out.notes, vec!["Research refreshed".to_string()]);
    }

    #[test]
    fn empty_research_is_rejected_without_retry() {
        let err = plan(
            &lead(),
            StageInput::Research { report: " ".into() },
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn proposal_requires_research() {
        let err = plan(
            &lead(),
            StageInput::Proposal {
                draft: "Dear Joe".into(),
            },
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn outreach_email_embeds_reference_code() {
        let lead = at_status(LeadStatus::Researched);
        let out = plan(
            &lead,
            StageInput::OutreachEmail { to: None },
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(out.new_status, Some(LeadStatus::Contacted));
        match &out.side_effects[..] {
            [SideEffect::SendEmail(email)] => {
                assert_eq!(email.to, "joe@joestacos.com");
                assert!(email.subject.contains(&lead.reference_code));
                assert!(email.body.contains(&lead.reference_code));
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[test]
    fn outreach_email_without_address_is_rejected() {
        let mut lead = at_status(LeadStatus::Researched);
        lead.email = None;
        let err = plan(
            &lead,
            StageInput::OutreachEmail { to: None },
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let out = plan(
            &lead,
            StageInput::OutreachEmail {
                to: Some("owner@joestacos.com".into()),
            },
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(out.attachments.email.as_deref(), Some("owner@joestacos.com"));
    }

    #[test]
    fn outreach_waits_for_mockup_when_required() {
        let config = PipelineConfig {
            require_website_mockup: true,
            ..Default::default()
        };
        let lead = at_status(LeadStatus::Researched);
        let out = plan(&lead, StageInput::OutreachEmail { to: None }, &config).unwrap();
        assert!(out.awaits_human());
        assert_eq!(out.new_status, None);

        let mut with_site = lead.clone();
        with_site.website_url = Some("https://mock.joestacos.site".into());
        let out = plan(&with_site, StageInput::OutreachEmail { to: None }, &config).unwrap();
        assert!(!out.awaits_human());
        match &out.side_effects[0] {
            SideEffect::SendEmail(email) => {
                assert!(email.body.contains("https://mock.joestacos.site"))
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn call_outcome_enriches_email() {
        let lead = at_status(LeadStatus::Researched);
        let mut out = plan(&lead, StageInput::OutreachCall, &PipelineConfig::default()).unwrap();
        let effect = out.side_effects[0].clone();
        out.absorb(
            &effect,
            EffectResult::CallPlaced(CallOutcome {
                transcript: "...".into(),
                outcome: "agreed_to_email".into(),
                captured_email: Some("maria@joestacos.com".into()),
            }),
        )
        .unwrap();
        assert_eq!(out.attachments.email.as_deref(), Some("maria@joestacos.com"));
        assert_eq!(out.new_status, Some(LeadStatus::Contacted));
    }

    #[test]
    fn dropped_call_is_an_error() {
        let lead = at_status(LeadStatus::Researched);
        let mut out = plan(&lead, StageInput::OutreachCall, &PipelineConfig::default()).unwrap();
        let effect = out.side_effects[0].clone();
        let err = out
            .absorb(
                &effect,
                EffectResult::CallPlaced(CallOutcome {
                    transcript: String::new(),
                    outcome: "issue_appeared".into(),
                    captured_email: None,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ExternalError::Failed { .. }));
    }

    #[test]
    fn reply_below_threshold_changes_nothing() {
        let lead = at_status(LeadStatus::Contacted);
        let c = Classification::manual(Intent::Positive, 0.69);
        let out = plan_reply(&lead, &c, &PipelineConfig::default());
        assert_eq!(out.new_status, None);
        assert_eq!(out.notes.len(), 1);
    }

    #[test]
    fn reply_drives_mapped_edge() {
        let lead = at_status(LeadStatus::Contacted);
        let c = Classification {
            intent: Intent::MeetingRequest,
            raw_intent: "meeting_request".into(),
            confidence: 0.9,
            slots: Default::default(),
            source: ClassificationSource::Llm,
            low_confidence: false,
        };
        let out = plan_reply(&lead, &c, &PipelineConfig::default());
        assert_eq!(out.new_status, Some(LeadStatus::Engaged));
    }

    #[test]
    fn meeting_defaults_duration_and_attendee() {
        let lead = at_status(LeadStatus::Confirmed);
        let start = Utc::now();
        let mut out = plan(
            &lead,
            StageInput::Meeting {
                request: MeetingRequest {
                    title: None,
                    start,
                    end: None,
                    duration_minutes: None,
                    attendee_email: None,
                    description: None,
                },
            },
            &PipelineConfig::default(),
        )
        .unwrap();

        let effect = out.side_effects[0].clone();
        match &effect {
            SideEffect::CreateEvent(req) => {
                assert_eq!(req.end - req.start, chrono::Duration::minutes(30));
                assert_eq!(req.attendees, vec!["joe@joestacos.com".to_string()]);
            }
            other => panic!("unexpected effect {other:?}"),
        }

        out.absorb(
            &effect,
            EffectResult::EventCreated(CalendarEvent {
                event_id: "evt-1".into(),
                join_link: Some("https://meet.example/abc".into()),
            }),
        )
        .unwrap();
        let meeting = out.attachments.meeting.unwrap();
        assert_eq!(meeting.event_id, "evt-1");
        assert_eq!(meeting.start, start);
    }

    #[test]
    fn mismatched_effect_result_is_invalid() {
        let mut out = StageOutcome::default();
        let effect = SideEffect::SendEmail(OutboundEmail {
            to: "a@b.com".into(),
            subject: "s".into(),
            body: "b".into(),
        });
        let err = out
            .absorb(
                &effect,
                EffectResult::EventCreated(CalendarEvent {
                    event_id: "x".into(),
                    join_link: None,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ExternalError::InvalidResponse { .. }));
    }
}
