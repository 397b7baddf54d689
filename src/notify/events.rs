//! Dashboard events pushed over the WebSocket and recorded in the activity log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::leads::model::{Lead, LeadStatus, Meeting, PendingHumanRequest};
use crate::pipeline::stages::Stage;

/// Every message a dashboard client can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    /// Full snapshot, always the first message on a connection.
    InitialState {
        leads: Vec<Lead>,
        pending_requests: Vec<PendingHumanRequest>,
        activity: Vec<ActivityEntry>,
        current_city: Option<String>,
        is_running: bool,
        timestamp: DateTime<Utc>,
    },
    LeadAdded {
        lead_id: Uuid,
        business: Lead,
        timestamp: DateTime<Utc>,
    },
    LeadUpdated {
        lead_id: Uuid,
        business: Lead,
        status_before: LeadStatus,
        status_after: LeadStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },
    StageStarted {
        lead_id: Uuid,
        stage: Stage,
        timestamp: DateTime<Utc>,
    },
    StageFailed {
        lead_id: Uuid,
        stage: Stage,
        message: String,
        timestamp: DateTime<Utc>,
    },
    TransitionRejected {
        lead_id: Uuid,
        status_before: LeadStatus,
        attempted: LeadStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },
    HumanInputRequest {
        lead_id: Uuid,
        request: PendingHumanRequest,
        timestamp: DateTime<Utc>,
    },
    HumanInputResolved {
        lead_id: Uuid,
        request_id: String,
        timestamp: DateTime<Utc>,
    },
    HumanInputCancelled {
        lead_id: Uuid,
        request_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    MeetingScheduled {
        lead_id: Uuid,
        meeting: Meeting,
        timestamp: DateTime<Utc>,
    },
    ProcessStarted {
        city: String,
        timestamp: DateTime<Utc>,
    },
    DiscoveryCompleted {
        city: String,
        count: usize,
        message: String,
        timestamp: DateTime<Utc>,
    },
    DiscoveryEmpty {
        city: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    DiscoveryFailed {
        city: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ProcessFinished {
        city: String,
        timestamp: DateTime<Utc>,
    },
    StateReset {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DashboardEvent {
    /// Wire name of the event, matching the serde tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InitialState { .. } => "initial_state",
            Self::LeadAdded { .. } => "lead_added",
            Self::LeadUpdated { .. } => "lead_updated",
            Self::StageStarted { .. } => "stage_started",
            Self::StageFailed { .. } => "stage_failed",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::HumanInputRequest { .. } => "human_input_request",
            Self::HumanInputResolved { .. } => "human_input_resolved",
            Self::HumanInputCancelled { .. } => "human_input_cancelled",
            Self::MeetingScheduled { .. } => "meeting_scheduled",
            Self::ProcessStarted { .. } => "process_started",
            Self::DiscoveryCompleted { .. } => "discovery_completed",
            Self::DiscoveryEmpty { .. } => "discovery_empty",
            Self::DiscoveryFailed { .. } => "discovery_failed",
            Self::ProcessFinished { .. } => "process_finished",
            Self::StateReset { .. } => "state_reset",
        }
    }

    pub fn lead_id(&self) -> Option<Uuid> {
        match self {
            Self::LeadAdded { lead_id, .. }
            | Self::LeadUpdated { lead_id, .. }
            | Self::StageStarted { lead_id, .. }
            | Self::StageFailed { lead_id, .. }
            | Self::TransitionRejected { lead_id, .. }
            | Self::HumanInputRequest { lead_id, .. }
            | Self::HumanInputResolved { lead_id, .. }
            | Self::HumanInputCancelled { lead_id, .. }
            | Self::MeetingScheduled { lead_id, .. } => Some(*lead_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::InitialState { timestamp, .. }
            | Self::LeadAdded { timestamp, .. }
            | Self::LeadUpdated { timestamp, .. }
            | Self::StageStarted { timestamp, .. }
            | Self::StageFailed { timestamp, .. }
            | Self::TransitionRejected { timestamp, .. }
            | Self::HumanInputRequest { timestamp, .. }
            | Self::HumanInputResolved { timestamp, .. }
            | Self::HumanInputCancelled { timestamp, .. }
            | Self::MeetingScheduled { timestamp, .. }
            | Self::ProcessStarted { timestamp, .. }
            | Self::DiscoveryCompleted { timestamp, .. }
            | Self::DiscoveryEmpty { timestamp, .. }
            | Self::DiscoveryFailed { timestamp, .. }
            | Self::ProcessFinished { timestamp, .. }
            | Self::StateReset { timestamp, .. } => *timestamp,
        }
    }

    /// Failures surface in the activity log with a higher severity.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::StageFailed { .. } | Self::DiscoveryFailed { .. } | Self::TransitionRejected { .. }
        )
    }

    /// Flatten into the audit-log shape.
    pub fn to_activity(&self) -> ActivityEntry {
        let (status_before, status_after) = match self {
            Self::LeadUpdated {
                status_before,
                status_after,
                ..
            } => (Some(*status_before), Some(*status_after)),
            Self::TransitionRejected {
                status_before,
                attempted,
                ..
            } => (Some(*status_before), Some(*attempted)),
            _ => (None, None),
        };

        let message = match self {
            Self::LeadAdded { business, .. } => Some(format!("Found {}", business.name)),
            Self::LeadUpdated { message, .. }
            | Self::StageFailed { message, .. }
            | Self::TransitionRejected { message, .. }
            | Self::HumanInputCancelled { message, .. }
            | Self::DiscoveryCompleted { message, .. }
            | Self::DiscoveryEmpty { message, .. }
            | Self::DiscoveryFailed { message, .. }
            | Self::StateReset { message, .. } => Some(message.clone()),
            Self::StageStarted { stage, .. } => Some(format!("{stage} started")),
            Self::HumanInputRequest { request, .. } => Some(request.prompt.clone()),
            Self::HumanInputResolved { request_id, .. } => {
                Some(format!("Human input {request_id} received"))
            }
            Self::MeetingScheduled { meeting, .. } => Some(format!(
                "Meeting '{}' at {}",
                meeting.title,
                meeting.start.to_rfc3339()
            )),
            Self::ProcessStarted { city, .. } => Some(format!("Discovery started for {city}")),
            Self::ProcessFinished { city, .. } => Some(format!("Discovery finished for {city}")),
            Self::InitialState { .. } => None,
        };

        ActivityEntry {
            event_type: self.event_type().to_string(),
            lead_id: self.lead_id(),
            status_before,
            status_after,
            message,
            is_failure: self.is_failure(),
            timestamp: self.timestamp(),
            payload: serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// One line of the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub event_type: String,
    pub lead_id: Option<Uuid>,
    pub status_before: Option<LeadStatus>,
    pub status_after: Option<LeadStatus>,
    pub message: Option<String>,
    #[serde(default)]
    pub is_failure: bool,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[cfg(test)]
impl ActivityEntry {
    pub(crate) fn for_test(event_type: &str, message: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            lead_id: None,
            status_before: None,
            status_after: None,
            message: Some(message.to_string()),
            is_failure: false,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }
}
