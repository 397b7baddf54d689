//! Inbound mail: match a reply to its lead, classify it and apply the result.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Pipeline;
use super::runner::{StageRequest, StageResult};
use super::stages::MeetingRequest;
use crate::channels::InboundEmail;
use crate::classifier::{Classification, Intent};
use crate::error::PipelineError;
use crate::leads::{Lead, LeadStatus};

/// Number of message ids remembered for deduplication.
const SEEN_CAPACITY: usize = 1000;

/// Bounded set of handled message ids, oldest evicted first.
#[derive(Debug, Default)]
pub(crate) struct SeenMessages {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenMessages {
    /// Record `id`. Returns false if it was already seen.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    /// Forget `id` so a redelivery is handled again.
    pub(crate) fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboundOutcome {
    /// Message id already handled.
    Duplicate,
    /// No lead matched by reference code or sender.
    Unmatched,
    Classified {
        lead_id: Uuid,
        intent: Intent,
        confidence: f32,
        status_before: LeadStatus,
        status_after: LeadStatus,
        meeting_scheduled: bool,
    },
}

impl Pipeline {
    /// Handle one inbound message. A message that fails is not remembered,
    /// so the mailbox can deliver it again.
    pub async fn handle_inbound_email(
        &self,
        email: InboundEmail,
    ) -> Result<InboundOutcome, PipelineError> {
        let message_id = email.message_id.clone();
        let tracked = !message_id.is_empty();
        if tracked && !self.mark_seen(&message_id) {
            debug!(message_id = %message_id, "Duplicate inbound email ignored");
            return Ok(InboundOutcome::Duplicate);
        }

        let result = self.process_inbound(email).await;
        if tracked && result.is_err() {
            self.forget_seen(&message_id);
        }
        result
    }

    async fn process_inbound(&self, email: InboundEmail) -> Result<InboundOutcome, PipelineError> {
        let Some(lead) = self.match_lead(&email).await else {
            debug!(sender = %email.sender, subject = %email.subject, "Inbound email matched no lead");
            return Ok(InboundOutcome::Unmatched);
        };

        let classification = self.classifier.classify(&email.subject, &email.body).await;
        info!(
            lead_id = %lead.id,
            intent = %classification.intent,
            confidence = classification.confidence,
            "Reply received"
        );

        let result = self
            .runner
            .run(
                lead.id,
                StageRequest::Reply {
                    classification: classification.clone(),
                },
            )
            .await?;
        let (updated, status_before) = match result {
            StageResult::Completed {
                lead,
                status_before,
            } => (*lead, status_before),
            StageResult::Suspended { .. } => (self.leads.get(lead.id).await?, lead.status),
        };

        let meeting_scheduled = self.auto_schedule(&updated, &classification).await;
        let status_after = if meeting_scheduled {
            LeadStatus::MeetingScheduled
        } else {
            updated.status
        };

        Ok(InboundOutcome::Classified {
            lead_id: updated.id,
            intent: classification.intent,
            confidence: classification.confidence,
            status_before,
            status_after,
            meeting_scheduled,
        })
    }

    fn mark_seen(&self, message_id: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(message_id),
            Err(_) => true,
        }
    }

    fn forget_seen(&self, message_id: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(message_id);
        }
    }

    /// Reference code in subject or body first, then exact sender address.
    async fn match_lead(&self, email: &InboundEmail) -> Option<Lead> {
        let text = format!("{}\n{}", email.subject, email.body);
        if let Some(lead) = self.leads.find_by_reference(&text).await {
            return Some(lead);
        }
        self.leads.find_by_email(&email.sender).await
    }

    /// Book a meeting when a confirmed lead proposes a time. Failures are
    /// logged and leave the lead confirmed.
    async fn auto_schedule(&self, lead: &Lead, classification: &Classification) -> bool {
        if classification.intent != Intent::MeetingRequest || lead.status != LeadStatus::Confirmed {
            return false;
        }
        let Some(start) = classification.slots.start else {
            return false;
        };

        let request = MeetingRequest {
            title: classification.slots.title.clone(),
            start,
            end: classification.slots.end,
            duration_minutes: None,
            attendee_email: classification
                .slots
                .attendees
                .first()
                .cloned()
                .or_else(|| lead.email.clone()),
            description: None,
        };

        match self.runner.run(lead.id, StageRequest::Meeting { request }).await {
            Ok(_) => true,
            Err(e) => {
                warn!(lead_id = %lead.id, error = %e, "Automatic meeting scheduling failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::leads::PlaceCandidate;
    use crate::services::Services;
    use crate::store::Database;
    use crate::store::testing::FlakyDb;

    fn reply(reference_code: &str) -> InboundEmail {
        InboundEmail {
            sender: "owner@bakery.com".into(),
            subject: format!("Re: A website for Bakery Dos [Ref: {reference_code}]"),
            body: "Yes, sounds good! Tell me more.".into(),
            message_id: "<reply-7@mail>".into(),
            thread_id: None,
        }
    }

    #[test]
    fn seen_set_deduplicates() {
        let mut seen = SeenMessages::default();
        assert!(seen.insert("<a@mail>"));
        assert!(!seen.insert("<a@mail>"));
        assert!(seen.insert("<b@mail>"));
        seen.clear();
        assert!(seen.insert("<a@mail>"));
    }

    #[test]
    fn removed_id_counts_as_new() {
        let mut seen = SeenMessages::default();
        seen.insert("<a@mail>");
        seen.insert("<b@mail>");
        seen.remove("<a@mail>");
        assert_eq!(seen.order.len(), 1);
        assert!(seen.insert("<a@mail>"));
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut seen = SeenMessages::default();
        for i in 0..SEEN_CAPACITY + 1 {
            assert!(seen.insert(&format!("<{i}@mail>")));
        }
        assert_eq!(seen.order.len(), SEEN_CAPACITY);
        // Oldest evicted, so it counts as new again.
        assert!(seen.insert("<0@mail>"));
        assert!(!seen.insert(&format!("<{SEEN_CAPACITY}@mail>")));
    }

    #[tokio::test]
    async fn failed_reply_is_handled_on_redelivery() {
        let db = Arc::new(FlakyDb::new().await);
        let shared: Arc<dyn Database> = db.clone();
        let p = Pipeline::open(Some(shared), Services::default(), PipelineConfig::default())
            .await
            .unwrap();
        let (lead, _) = p
            .leads()
            .create(
                PlaceCandidate {
                    place_id: "p_bakery".into(),
                    name: "Bakery Dos".into(),
                    address: "3 Rio St".into(),
                    phone: None,
                    website: None,
                    rating: Some(4.9),
                    review_count: Some(12),
                },
                "Austin",
            )
            .await
            .unwrap();
        p.leads()
            .update(lead.id, |l| {
                l.status = LeadStatus::Contacted;
                Ok(())
            })
            .await
            .unwrap();

        db.fail_lead_writes(true);
        let err = p.handle_inbound_email(reply(&lead.reference_code)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Database(_)));
        assert_eq!(p.get_lead(lead.id).await.unwrap().status, LeadStatus::Contacted);

        db.fail_lead_writes(false);
        let outcome = p.handle_inbound_email(reply(&lead.reference_code)).await.unwrap();
        assert!(matches!(
            outcome,
            InboundOutcome::Classified {
                status_after: LeadStatus::Engaged,
                ..
            }
        ));
        assert_eq!(
            p.handle_inbound_email(reply(&lead.reference_code)).await.unwrap(),
            InboundOutcome::Duplicate
        );
    }
}
