//! LLM reply classifier with keyword fallback.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Classification, ClassificationSource, ExtractedSlots, Intent, classify_keywords};
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, parse_llm_json};

const CLASSIFIER_PROMPT: &str = r#"You classify replies from small-business owners to a cold outreach e-mail offering a website.

Pick exactly one intent:
- meeting_request: asks for or proposes a meeting, call or appointment
- positive: interested, wants to hear more, no meeting asked for yet
- negative: not interested right now
- confirmation: explicitly agrees to go ahead with the offer
- decline: firm refusal, asks to stop contact or unsubscribe
- other: anything else (out of office, unrelated, unclear)

If a meeting time is mentioned, extract it as ISO-8601 with timezone.

Respond with JSON only:
{"intent": "...", "confidence": 0.0-1.0, "slots": {"title": null, "start": null, "end": null, "attendees": []}}"#;

#[derive(Debug, Deserialize)]
struct LlmClassification {
    intent: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    slots: LlmSlots,
}

#[derive(Debug, Default, Deserialize)]
struct LlmSlots {
    title: Option<String>,
    start: Option<String>,
    end: Option<String>,
    #[serde(default)]
    attendees: Vec<String>,
}

fn parse_datetime(s: Option<&str>) -> Option<DateTime<Utc>> {
    let s = s?.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

impl From<LlmSlots> for ExtractedSlots {
    fn from(s: LlmSlots) -> Self {
        Self {
            start: parse_datetime(s.start.as_deref()),
            end: parse_datetime(s.end.as_deref()),
            title: s.title.filter(|t| !t.trim().is_empty()),
            attendees: s.attendees,
        }
    }
}

/// Classifies inbound replies. One LLM attempt, bounded by `timeout`; any
/// failure falls through to keywords.
pub struct ReplyClassifier {
    llm: Option<Arc<dyn LlmProvider>>,
    threshold: f32,
    timeout: Duration,
}

impl ReplyClassifier {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>, threshold: f32, timeout: Duration) -> Self {
        Self {
            llm,
            threshold,
            timeout,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn classify(&self, subject: &str, body: &str) -> Classification {
        let text = if subject.is_empty() {
            body.to_string()
        } else {
            format!("Subject: {subject}\n\n{body}")
        };

        let classification = match &self.llm {
            Some(llm) => match self.classify_llm(llm.as_ref(), &text).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "LLM classification failed, using keyword fallback");
                    classify_keywords(&text)
                }
            },
            None => classify_keywords(&text),
        };

        let classification = classification.apply_threshold(self.threshold);
        debug!(
            intent = %classification.intent,
            confidence = classification.confidence,
            source = ?classification.source,
            low_confidence = classification.low_confidence,
            "Reply classified"
        );
        classification
    }

    async fn classify_llm(
        &self,
        llm: &dyn LlmProvider,
        text: &str,
    ) -> Result<Classification, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(text),
        ])
        .with_temperature(0.1)
        .with_max_tokens(512);

        let response = tokio::time::timeout(self.timeout, llm.complete(request))
            .await
            .map_err(|_| LlmError::RequestFailed {
                provider: llm.model_name().to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            })??;

        let parsed: LlmClassification = parse_llm_json(&response.content)?;
        Ok(Classification {
            intent: Intent::parse_loose(&parsed.intent),
            raw_intent: parsed.intent,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            slots: parsed.slots.into(),
            source: ClassificationSource::Llm,
            low_confidence: false,
        })
    }
}
