//! Keyword fallback used when the LLM is unavailable or returns garbage.
//!
//! Decline and negative phrases are counted first and removed from the text,
//! so "not interested" does not also count as "interested" and "don't call"
//! does not count as a meeting request.

use std::sync::LazyLock;

use regex::Regex;

use super::{Classification, ClassificationSource, ExtractedSlots, Intent};

/// Confidence reported whenever a keyword class wins.
pub const KEYWORD_CONFIDENCE: f32 = 0.75;

const DECLINE: &[&str] = &[
    "decline",
    "reject",
    "cancel",
    "unsubscribe",
    "remove me",
    "stop",
    "don't call",
    "do not contact",
];

const NEGATIVE: &[&str] = &[
    "not interested",
    "no thanks",
    "no thank you",
    "not now",
    "maybe later",
    "no",
];

const CONFIRMATION: &[&str] = &[
    "confirm",
    "confirmed",
    "approved",
    "go ahead",
    "let's proceed",
    "proceed",
    "sign me up",
    "count me in",
    "let's do it",
];

const MEETING: &[&str] = &[
    "meeting",
    "meet",
    "schedule",
    "call",
    "discuss",
    "available",
    "appointment",
];

const POSITIVE: &[&str] = &[
    "yes",
    "interested",
    "accept",
    "agree",
    "sounds good",
    "i'm in",
    "okay",
    "ok",
    "sure",
    "absolutely",
    "definitely",
    "looking forward",
];

/// Case-insensitive, word-bounded alternation. Longer phrases first so the
/// regex prefers them.
fn word_list(words: &[&str]) -> Regex {
    let mut sorted: Vec<&str> = words.to_vec();
    sorted.sort_by_key(|w| std::cmp::Reverse(w.len()));
    let alternation = sorted
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).unwrap()
}

static DECLINE_RE: LazyLock<Regex> = LazyLock::new(|| word_list(DECLINE));
static NEGATIVE_RE: LazyLock<Regex> = LazyLock::new(|| word_list(NEGATIVE));
static CONFIRMATION_RE: LazyLock<Regex> = LazyLock::new(|| word_list(CONFIRMATION));
static MEETING_RE: LazyLock<Regex> = LazyLock::new(|| word_list(MEETING));
static POSITIVE_RE: LazyLock<Regex> = LazyLock::new(|| word_list(POSITIVE));

/// Keyword hit counts for one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeywordScores {
    pub decline: usize,
    pub negative: usize,
    pub confirmation: usize,
    pub meeting: usize,
    pub positive: usize,
}

impl KeywordScores {
    pub fn score(text: &str) -> Self {
        let text = text.replace('\u{2019}', "'");
        let decline = DECLINE_RE.find_iter(&text).count();
        let text = DECLINE_RE.replace_all(&text, " ");
        let negative = NEGATIVE_RE.find_iter(&text).count();
        let text = NEGATIVE_RE.replace_all(&text, " ");

        Self {
            decline,
            negative,
            confirmation: CONFIRMATION_RE.find_iter(&text).count(),
            meeting: MEETING_RE.find_iter(&text).count(),
            positive: POSITIVE_RE.find_iter(&text).count(),
        }
    }

    /// Highest-priority class with any hits.
    pub fn winner(&self) -> Intent {
        if self.decline > 0 {
            Intent::Decline
        } else if self.negative > 0 && self.negative > self.positive + self.confirmation {
            Intent::Negative
        } else if self.confirmation > 0 {
            Intent::Confirmation
        } else if self.meeting > 0 {
            Intent::MeetingRequest
        } else if self.positive > 0 {
            Intent::Positive
        } else if self.negative > 0 {
            Intent::Negative
        } else {
            Intent::Other
        }
    }
}

pub fn classify_keywords(text: &str) -> Classification {
    let intent = KeywordScores::score(text).winner();
    let confidence = if intent == Intent::Other {
        0.0
    } else {
        KEYWORD_CONFIDENCE
    };
    Classification {
        intent,
        raw_intent: intent.as_str().to_string(),
        confidence,
        slots: ExtractedSlots::default(),
        source: ClassificationSource::KeywordFallback,
        low_confidence: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(text: &str) -> Intent {
        classify_keywords(text).intent
    }

    #[test]
    fn positive_reply() {
        assert_eq!(intent("Yes, sounds good!"), Intent::Positive);
        assert_eq!(classify_keywords("Sure").confidence, KEYWORD_CONFIDENCE);
    }

    #[test]
    fn not_interested_is_negative_not_positive() {
        assert_eq!(intent("Thanks, but we're not interested."), Intent::Negative);
    }

    #[test]
    fn dont_call_is_decline_not_meeting() {
        assert_eq!(intent("Please don't call again."), Intent::Decline);
        assert_eq!(intent("Unsubscribe me"), Intent::Decline);
    }

    #[test]
    fn meeting_request() {
        assert_eq!(
            intent("Could we schedule a call on Tuesday?"),
            Intent::MeetingRequest
        );
    }

    #[test]
    fn confirmation_beats_meeting_and_positive() {
        assert_eq!(
            intent("Yes, go ahead and we can discuss details later"),
            Intent::Confirmation
        );
    }

    #[test]
    fn word_boundaries_are_respected() {
        // "know" and "note" contain "no"; "stopwatch" contains "stop".
        assert_eq!(intent("I know, noted. Nice stopwatch."), Intent::Other);
    }

    #[test]
    fn other_has_zero_confidence() {
        let c = classify_keywords("Here is my invoice for March.");
        assert_eq!(c.intent, Intent::Other);
        assert_eq!(c.confidence, 0.0);
        assert_eq!(c.source, ClassificationSource::KeywordFallback);
    }

    #[test]
    fn curly_apostrophes_are_normalised() {
        assert_eq!(intent("Please don\u{2019}t call"), Intent::Decline);
    }

    #[test]
    fn mixed_negative_and_positive_prefers_positive() {
        // One negative, two positives.
        assert_eq!(intent("Yes, sounds good, but not now"), Intent::Positive);
    }
}
