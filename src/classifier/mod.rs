//! Reply classification: turns a prospect's e-mail into an intent and maps
//! that intent to a state-machine edge.

pub mod keywords;
pub mod reply;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::leads::LeadStatus;

pub use keywords::classify_keywords;
pub use reply::ReplyClassifier;

/// What a reply means for the deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    MeetingRequest,
    Positive,
    Negative,
    Confirmation,
    Decline,
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MeetingRequest => "meeting_request",
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Confirmation => "confirmation",
            Self::Decline => "decline",
            Self::Other => "other",
        }
    }

    /// Lenient parse of model output; unknown labels become `Other`.
    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "meeting_request" | "meeting" => Self::MeetingRequest,
            "positive" | "interested" => Self::Positive,
            "negative" | "not_interested" => Self::Negative,
            "confirmation" | "confirmed" => Self::Confirmation,
            "decline" | "declined" | "rejection" => Self::Decline,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Llm,
    KeywordFallback,
    Manual,
}

/// Meeting details pulled out of a reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSlots {
    pub title: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Effective intent after the confidence threshold.
    pub intent: Intent,
    /// Intent as originally produced, before any downgrade.
    pub raw_intent: String,
    pub confidence: f32,
    #[serde(default)]
    pub slots: ExtractedSlots,
    pub source: ClassificationSource,
    /// Set when the result was downgraded to `Other` for low confidence.
    #[serde(default)]
    pub low_confidence: bool,
}

impl Classification {
    /// A classification supplied directly by an operator or external agent.
    pub fn manual(intent: Intent, confidence: f32) -> Self {
        Self {
            intent,
            raw_intent: intent.as_str().to_string(),
            confidence,
            slots: ExtractedSlots::default(),
            source: ClassificationSource::Manual,
            low_confidence: false,
        }
    }

    /// Downgrade to `Other` when below `threshold`.
    pub fn apply_threshold(mut self, threshold: f32) -> Self {
        if self.intent != Intent::Other && self.confidence < threshold {
            self.intent = Intent::Other;
            self.low_confidence = true;
        }
        self
    }
}

/// The edge a classified reply drives from `status`, if any.
pub fn intent_transition(status: LeadStatus, intent: Intent) -> Option<LeadStatus> {
    use Intent::*;
    use LeadStatus::*;

    match (status, intent) {
        (Contacted, Positive | MeetingRequest) => Some(Engaged),
        (Contacted, Negative) => Some(NotInterested),
        (Contacted | Converting, Decline) => Some(Rejected),
        (Engaged, MeetingRequest) => Some(Converting),
        (Converting, Confirmation) => Some(Confirmed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_from_contacted() {
        assert_eq!(
            intent_transition(LeadStatus::Contacted, Intent::Positive),
            Some(LeadStatus::Engaged)
        );
        assert_eq!(
            intent_transition(LeadStatus::Contacted, Intent::MeetingRequest),
            Some(LeadStatus::Engaged)
        );
        assert_eq!(
            intent_transition(LeadStatus::Contacted, Intent::Negative),
            Some(LeadStatus::NotInterested)
        );
        assert_eq!(
            intent_transition(LeadStatus::Contacted, Intent::Decline),
            Some(LeadStatus::Rejected)
        );
        assert_eq!(intent_transition(LeadStatus::Contacted, Intent::Other), None);
        assert_eq!(intent_transition(LeadStatus::Contacted, Intent::Confirmation), None);
    }

    #[test]
    fn later_transitions() {
        assert_eq!(
            intent_transition(LeadStatus::Engaged, Intent::MeetingRequest),
            Some(LeadStatus::Converting)
        );
        assert_eq!(
            intent_transition(LeadStatus::Converting, Intent::Confirmation),
            Some(LeadStatus::Confirmed)
        );
        assert_eq!(
            intent_transition(LeadStatus::Converting, Intent::Decline),
            Some(LeadStatus::Rejected)
        );
        assert_eq!(intent_transition(LeadStatus::Engaged, Intent::Positive), None);
    }

    #[test]
    fn every_mapped_edge_is_legal() {
        let intents = [
            Intent::MeetingRequest,
            Intent::Positive,
            Intent::Negative,
            Intent::Confirmation,
            Intent::Decline,
            Intent::Other,
        ];
        for status in LeadStatus::ALL {
            for intent in intents {
                if let Some(target) = intent_transition(status, intent) {
                    assert!(status.can_transition_to(target), "{status} -> {target}");
                }
            }
        }
    }

    #[test]
    fn threshold_downgrades_to_other() {
        let c = Classification::manual(Intent::Positive, 0.69).apply_threshold(0.7);
        assert_eq!(c.intent, Intent::Other);
        assert_eq!(c.raw_intent, "positive");
        assert!(c.low_confidence);

        let c = Classification::manual(Intent::Positive, 0.7).apply_threshold(0.7);
        assert_eq!(c.intent, Intent::Positive);
        assert!(!c.low_confidence);
    }

    #[test]
    fn loose_intent_parsing() {
        assert_eq!(Intent::parse_loose("Meeting Request"), Intent::MeetingRequest);
        assert_eq!(Intent::parse_loose("not-interested"), Intent::Negative);
        assert_eq!(Intent::parse_loose("banana"), Intent::Other);
    }
}
