//! Lead data model and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Discovered by geo search, nothing done yet.
    Found,
    /// Research stage attached a report.
    Researched,
    /// Outreach email sent or call placed.
    Contacted,
    /// Replied positively.
    Engaged,
    /// Replied negatively.
    NotInterested,
    /// No reply within the follow-up window.
    NoResponse,
    /// Marked as a hot lead.
    Converting,
    /// Explicitly confirmed.
    Confirmed,
    /// Calendar event created.
    MeetingScheduled,
    /// Explicit decline.
    Rejected,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 10] = [
        Self::Found,
        Self::Researched,
        Self::Contacted,
        Self::Engaged,
        Self::NotInterested,
        Self::NoResponse,
        Self::Converting,
        Self::Confirmed,
        Self::MeetingScheduled,
        Self::Rejected,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: LeadStatus) -> bool {
        use LeadStatus::*;

        matches!(
            (self, target),
            (Found, Researched) |
            (Researched, Contacted) |
            // Reply outcomes
            (Contacted, Engaged) | (Contacted, NotInterested) | (Contacted, NoResponse) |
            // Hot lead
            (Engaged, Converting) |
            (Converting, Confirmed) |
            (Confirmed, MeetingScheduled) |
            // Explicit decline
            (Contacted, Rejected) | (Converting, Rejected)
        )
    }

    /// No outgoing edges.
    pub fn is_terminal(&self) -> bool {
        Self::ALL.iter().all(|s| !self.can_transition_to(*s))
    }

    /// Human-facing label for dashboards. Never parsed back into a status.
    pub fn display_label(&self) -> &'static str {
        match self {
            Self::Found => "New lead",
            Self::Researched => "Researched",
            Self::Contacted => "Awaiting reply",
            Self::Engaged => "Interested",
            Self::NotInterested => "Not interested",
            Self::NoResponse => "No response",
            Self::Converting => "Hot lead",
            Self::Confirmed => "Confirmed",
            Self::MeetingScheduled => "Meeting booked",
            Self::Rejected => "Declined",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Researched => "researched",
            Self::Contacted => "contacted",
            Self::Engaged => "engaged",
            Self::NotInterested => "not_interested",
            Self::NoResponse => "no_response",
            Self::Converting => "converting",
            Self::Confirmed => "confirmed",
            Self::MeetingScheduled => "meeting_scheduled",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown lead status: {s}"))
    }
}

/// One append-only annotation on a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadNote {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub text: String,
}

/// Research report attached by the research stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Research {
    pub summary: String,
    pub produced_at: DateTime<Utc>,
}

/// Proposal draft attached by the proposal stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub body: String,
    pub produced_at: DateTime<Utc>,
}

/// Calendar meeting booked with the lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub event_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub location_link: Option<String>,
}

/// A business returned by the geo-discovery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceCandidate {
    pub place_id: String,
    pub name: String,
    pub address: String,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f32>,
    pub review_count: Option<u32>,
}

/// A business lead tracked through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub place_id: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website_url: Option<String>,
    pub rating: Option<f32>,
    pub review_count: Option<u32>,
    pub status: LeadStatus,
    /// Label for dashboards, derived from `status`.
    pub status_label: String,
    pub notes: Vec<LeadNote>,
    /// Short code embedded in outreach mail so replies can be matched.
    pub reference_code: String,
    pub research: Option<Research>,
    pub proposal: Option<Proposal>,
    pub meeting: Option<Meeting>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Create a new lead in `found` status from a discovery candidate.
    pub fn from_candidate(candidate: PlaceCandidate, city: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            place_id: candidate.place_id,
            name: candidate.name,
            address: candidate.address,
            city: city.into(),
            phone: candidate.phone,
            email: None,
            website_url: candidate.website,
            rating: candidate.rating,
            review_count: candidate.review_count,
            status: LeadStatus::Found,
            status_label: LeadStatus::Found.display_label().to_string(),
            notes: Vec::new(),
            reference_code: reference_code_for(id),
            research: None,
            proposal: None,
            meeting: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a note. Existing notes are never modified.
    pub fn add_note(&mut self, stage: impl Into<String>, text: impl Into<String>) {
        self.notes.push(LeadNote {
            at: Utc::now(),
            stage: stage.into(),
            text: text.into(),
        });
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition_to(&mut self, target: LeadStatus) -> Result<LeadStatus, LeadStatus> {
        if !self.status.can_transition_to(target) {
            return Err(self.status);
        }
        let previous = self.status;
        self.status = target;
        self.status_label = target.display_label().to_string();
        Ok(previous)
    }

    /// Natural key used for idempotent discovery.
    pub fn natural_key(&self) -> (String, String) {
        natural_key(&self.city, &self.place_id)
    }
}

pub fn natural_key(city: &str, place_id: &str) -> (String, String) {
    (city.trim().to_lowercase(), place_id.to_string())
}

/// Eight uppercase hex characters derived from the lead id.
pub fn reference_code_for(id: Uuid) -> String {
    id.simple().to_string()[..8].to_uppercase()
}

/// Filter for listing leads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadFilter {
    pub status: Option<LeadStatus>,
    pub city: Option<String>,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        if let Some(status) = self.status
            && lead.status != status
        {
            return false;
        }
        if let Some(city) = &self.city
            && !lead.city.trim().eq_ignore_ascii_case(city.trim())
        {
            return false;
        }
        true
    }
}

// ── Human requests ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanRequestStatus {
    Pending,
    Resolved,
    Cancelled,
    Expired,
}

impl HumanRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// What the human is being asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanRequestKind {
    /// Build a website mock-up and reply with its URL.
    WebsiteMockup,
    /// Approve or annotate; the response is recorded as a note.
    #[default]
    Approval,
}

/// A suspension point awaiting an external decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHumanRequest {
    pub request_id: String,
    pub lead_id: Uuid,
    /// Stage to resume once resolved.
    pub stage: crate::pipeline::stages::Stage,
    pub kind: HumanRequestKind,
    pub prompt: String,
    pub status: HumanRequestStatus,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PendingHumanRequest {
    pub fn is_pending(&self) -> bool {
        self.status == HumanRequestStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at.is_some_and(|at| at <= now)
    }
}
